use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::from_secs(60),
            Timeframe::M5 => Duration::from_secs(300),
            Timeframe::M15 => Duration::from_secs(900),
            Timeframe::H1 => Duration::from_secs(3600),
            Timeframe::H4 => Duration::from_secs(14400),
            Timeframe::D1 => Duration::from_secs(86400),
        }
    }

    /// Accepts both the short form (`15m`) and broker codes (`M15`, `H4`, `D1`).
    pub fn from_str_loose(s: &str) -> Option<Timeframe> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" | "m1" => Some(Timeframe::M1),
            "5m" | "m5" => Some(Timeframe::M5),
            "15m" | "m15" => Some(Timeframe::M15),
            "1h" | "h1" | "60m" => Some(Timeframe::H1),
            "4h" | "h4" => Some(Timeframe::H4),
            "1d" | "d1" | "daily" => Some(Timeframe::D1),
            _ => None,
        }
    }

    pub fn class(&self) -> TimeframeClass {
        match self {
            Timeframe::M1 | Timeframe::M5 => TimeframeClass::Scalping,
            Timeframe::M15 | Timeframe::H1 => TimeframeClass::Intraday,
            Timeframe::H4 | Timeframe::D1 => TimeframeClass::Swing,
        }
    }

    /// The next timeframe up, used for higher-timeframe alignment.
    pub fn higher(&self) -> Option<Timeframe> {
        match self {
            Timeframe::M1 => Some(Timeframe::M5),
            Timeframe::M5 => Some(Timeframe::M15),
            Timeframe::M15 => Some(Timeframe::H1),
            Timeframe::H1 => Some(Timeframe::H4),
            Timeframe::H4 => Some(Timeframe::D1),
            Timeframe::D1 => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeframeClass {
    Scalping,
    Intraday,
    Swing,
}

impl fmt::Display for TimeframeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeframeClass::Scalping => write!(f, "scalping"),
            TimeframeClass::Intraday => write!(f, "intraday"),
            TimeframeClass::Swing => write!(f, "swing"),
        }
    }
}
