use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// +1 for longs, -1 for shorts. Multiply a raw price delta by this to get
    /// the move in the trade's favor.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// True when `candidate` is strictly more favorable than `reference`
    /// for a stop or target on this side.
    pub fn is_better(&self, candidate: f64, reference: f64) -> bool {
        match self {
            Direction::Long => candidate > reference,
            Direction::Short => candidate < reference,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Bullish => write!(f, "bullish"),
            Trend::Bearish => write!(f, "bearish"),
            Trend::Neutral => write!(f, "neutral"),
        }
    }
}

impl Trend {
    pub fn to_direction(self) -> Option<Direction> {
        match self {
            Trend::Bullish => Some(Direction::Long),
            Trend::Bearish => Some(Direction::Short),
            Trend::Neutral => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwingType {
    High,
    Low,
}

impl fmt::Display for SwingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwingType::High => write!(f, "high"),
            SwingType::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    Structural,
    Zone,
    Atr,
}

impl fmt::Display for StopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopMode::Structural => write!(f, "structural"),
            StopMode::Zone => write!(f, "zone"),
            StopMode::Atr => write!(f, "atr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Enter,
    Wait,
    Skip,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Enter => write!(f, "ENTER"),
            Decision::Wait => write!(f, "WAIT"),
            Decision::Skip => write!(f, "SKIP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStyle {
    Market,
    PendingStop,
    PendingLimit,
}

impl fmt::Display for OrderStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStyle::Market => write!(f, "market"),
            OrderStyle::PendingStop => write!(f, "pending_stop"),
            OrderStyle::PendingLimit => write!(f, "pending_limit"),
        }
    }
}

impl OrderStyle {
    pub fn from_str_loose(s: &str) -> Option<OrderStyle> {
        match s.to_lowercase().as_str() {
            "market" => Some(OrderStyle::Market),
            "stop" | "pending_stop" => Some(OrderStyle::PendingStop),
            "limit" | "pending_limit" => Some(OrderStyle::PendingLimit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Win,
    Loss,
    Breakeven,
    Expired,
    Manual,
    External,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Win => write!(f, "win"),
            CloseReason::Loss => write!(f, "loss"),
            CloseReason::Breakeven => write!(f, "breakeven"),
            CloseReason::Expired => write!(f, "expired"),
            CloseReason::Manual => write!(f, "manual"),
            CloseReason::External => write!(f, "external"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionState {
    Pending,
    Open,
    Partial1,
    Partial2,
    Closed(CloseReason),
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::Pending => write!(f, "pending"),
            PositionState::Open => write!(f, "open"),
            PositionState::Partial1 => write!(f, "partial_1"),
            PositionState::Partial2 => write!(f, "partial_2"),
            PositionState::Closed(r) => write!(f, "closed_{}", r),
        }
    }
}

impl PositionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, PositionState::Closed(_))
    }

    /// Filled and still carrying volume.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            PositionState::Open | PositionState::Partial1 | PositionState::Partial2
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Trending,
    Ranging,
    Volatile,
    Quiet,
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRegime::Trending => write!(f, "trending"),
            MarketRegime::Ranging => write!(f, "ranging"),
            MarketRegime::Volatile => write!(f, "volatile"),
            MarketRegime::Quiet => write!(f, "quiet"),
        }
    }
}
