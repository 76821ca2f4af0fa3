use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::DecisionConfig;
use crate::filters::{ConfluenceReport, MarketSnapshot};
use crate::models::{Decision, Direction, MarketRegime};
use crate::signals::{MlSignal, PatternSignal};
use crate::trading::risk::{GateStatus, HaltReason};

/// Why a bar was skipped regardless of its score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RiskGate(HaltReason),
    NoPattern,
    StalePattern,
    MarketClosed,
    NewsBlackout,
    InsideOpposingZone,
    MlVeto,
    NoActiveFilters,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::RiskGate(r) => write!(f, "risk gate: {}", r),
            BlockReason::NoPattern => write!(f, "no active pattern"),
            BlockReason::StalePattern => write!(f, "pattern older than validity window"),
            BlockReason::MarketClosed => write!(f, "market closed"),
            BlockReason::NewsBlackout => write!(f, "news blackout"),
            BlockReason::InsideOpposingZone => write!(f, "inside opposing zone"),
            BlockReason::MlVeto => write!(f, "model veto"),
            BlockReason::NoActiveFilters => write!(f, "no active filters"),
        }
    }
}

/// Regime and blocking context for one bar, read off the snapshot.
#[derive(Debug, Clone)]
pub struct RegimeContext {
    pub regime: MarketRegime,
    pub now: DateTime<Utc>,
    pub pattern_validity: Duration,
    pub reentry_since: Option<DateTime<Utc>>,
    pub market_open: bool,
    pub news_blackout: bool,
    pub inside_opposing_zone: bool,
    pub ml: Option<MlSignal>,
}

impl RegimeContext {
    pub fn from_snapshot(snap: &MarketSnapshot, news_blackout_minutes: i64) -> Self {
        let inside_opposing_zone = snap
            .direction()
            .is_some_and(|d| snap.zones.inside_opposing(d, snap.data.quote.mid()));
        Self {
            regime: snap.regime,
            now: snap.now(),
            pattern_validity: snap.pattern_validity,
            reentry_since: snap.reentry_since,
            market_open: snap.market_open,
            news_blackout: snap.news_within(news_blackout_minutes),
            inside_opposing_zone,
            ml: snap.ml,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub direction: Option<Direction>,
    pub blocked_by: Option<BlockReason>,
}

impl DecisionOutcome {
    fn skip(reason: BlockReason, direction: Option<Direction>) -> Self {
        Self {
            decision: Decision::Skip,
            direction,
            blocked_by: Some(reason),
        }
    }
}

pub struct DecisionEngine {
    ml_veto_confidence: f64,
}

impl DecisionEngine {
    pub fn new(cfg: &DecisionConfig) -> Self {
        Self {
            ml_veto_confidence: cfg.ml_veto_confidence,
        }
    }

    /// ENTER / WAIT / SKIP for this bar. Gates and blocking conditions are
    /// checked before the score so that no score can override them.
    pub fn decide(
        &self,
        report: &ConfluenceReport,
        gate: GateStatus,
        ctx: &RegimeContext,
        pattern: Option<&PatternSignal>,
    ) -> DecisionOutcome {
        let direction = pattern.map(|p| p.direction);

        if let GateStatus::Halted(reason) = gate {
            return DecisionOutcome::skip(BlockReason::RiskGate(reason), direction);
        }
        let Some(pattern) = pattern else {
            return DecisionOutcome::skip(BlockReason::NoPattern, None);
        };

        let reference = match ctx.reentry_since {
            Some(t) if t > pattern.detected_at => t,
            _ => pattern.detected_at,
        };
        if ctx.now - reference > ctx.pattern_validity {
            return DecisionOutcome::skip(BlockReason::StalePattern, direction);
        }

        if let Some(block) = self.blocking_condition(ctx) {
            debug!("{} {} blocked: {}", pattern.name, pattern.direction, block);
            return DecisionOutcome::skip(block, direction);
        }
        if report.active == 0 {
            return DecisionOutcome::skip(BlockReason::NoActiveFilters, direction);
        }

        let decision = if report.meets_threshold() {
            Decision::Enter
        } else if report.decision == Decision::Wait {
            Decision::Wait
        } else {
            Decision::Skip
        };
        DecisionOutcome {
            decision,
            direction,
            blocked_by: None,
        }
    }

    fn blocking_condition(&self, ctx: &RegimeContext) -> Option<BlockReason> {
        if !ctx.market_open {
            return Some(BlockReason::MarketClosed);
        }
        if ctx.news_blackout {
            return Some(BlockReason::NewsBlackout);
        }
        if ctx.inside_opposing_zone {
            return Some(BlockReason::InsideOpposingZone);
        }
        if let Some(ml) = ctx.ml {
            if ml.signal == Decision::Skip && ml.confidence >= self.ml_veto_confidence {
                return Some(BlockReason::MlVeto);
            }
        }
        None
    }
}
