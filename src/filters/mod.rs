//! The twenty named confluence filters and the registry that scores them.
//!
//! Each filter is a pure predicate over a [`MarketSnapshot`]. A predicate may
//! abstain (`None`) when its input is unavailable for this bar; an abstaining
//! filter is treated exactly like a disabled one and stays out of both the
//! score and the denominator.

pub mod predicates;
pub mod snapshot;

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::{DecisionConfig, FilterThresholds, TradingProfile};
use crate::models::{Decision, Direction};

pub use predicates::Predicate;
pub use snapshot::MarketSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterId {
    Spread,
    Volume,
    Slippage,
    Session,
    HtfAlignment,
    Correlation,
    NewsBlackout,
    VolatilityRegime,
    PatternStaleness,
    LiquiditySweep,
    RetailTrap,
    BreakOfStructure,
    Divergence,
    PatternWinRate,
    SelfTuned,
    RegimeStrategy,
    ZoneAlignment,
    PatternStrength,
    MlConsensus,
    TrendMomentum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterGroup {
    ExecutionQuality,
    Context,
    AdaptiveRisk,
    Structural,
    Meta,
}

impl FilterId {
    pub const ALL: [FilterId; 20] = [
        FilterId::Spread,
        FilterId::Volume,
        FilterId::Slippage,
        FilterId::Session,
        FilterId::HtfAlignment,
        FilterId::Correlation,
        FilterId::NewsBlackout,
        FilterId::VolatilityRegime,
        FilterId::PatternStaleness,
        FilterId::LiquiditySweep,
        FilterId::RetailTrap,
        FilterId::BreakOfStructure,
        FilterId::Divergence,
        FilterId::PatternWinRate,
        FilterId::SelfTuned,
        FilterId::RegimeStrategy,
        FilterId::ZoneAlignment,
        FilterId::PatternStrength,
        FilterId::MlConsensus,
        FilterId::TrendMomentum,
    ];

    /// 1-based id, stable across releases.
    pub fn number(&self) -> usize {
        *self as usize + 1
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterId::Spread => "spread",
            FilterId::Volume => "volume",
            FilterId::Slippage => "slippage",
            FilterId::Session => "session",
            FilterId::HtfAlignment => "htf_alignment",
            FilterId::Correlation => "correlation",
            FilterId::NewsBlackout => "news_blackout",
            FilterId::VolatilityRegime => "volatility_regime",
            FilterId::PatternStaleness => "pattern_staleness",
            FilterId::LiquiditySweep => "liquidity_sweep",
            FilterId::RetailTrap => "retail_trap",
            FilterId::BreakOfStructure => "break_of_structure",
            FilterId::Divergence => "divergence",
            FilterId::PatternWinRate => "pattern_win_rate",
            FilterId::SelfTuned => "self_tuned",
            FilterId::RegimeStrategy => "regime_strategy",
            FilterId::ZoneAlignment => "zone_alignment",
            FilterId::PatternStrength => "pattern_strength",
            FilterId::MlConsensus => "ml_consensus",
            FilterId::TrendMomentum => "trend_momentum",
        }
    }

    /// Accepts the snake_case name or the 1-based number.
    pub fn from_name(s: &str) -> Option<FilterId> {
        let s = s.trim().to_lowercase();
        if let Ok(n) = s.parse::<usize>() {
            return n.checked_sub(1).and_then(|i| Self::ALL.get(i).copied());
        }
        Self::ALL.iter().copied().find(|f| f.name() == s)
    }

    pub fn group(&self) -> FilterGroup {
        match self {
            FilterId::Spread | FilterId::Volume | FilterId::Slippage => FilterGroup::ExecutionQuality,
            FilterId::Session
            | FilterId::HtfAlignment
            | FilterId::Correlation
            | FilterId::NewsBlackout => FilterGroup::Context,
            FilterId::VolatilityRegime | FilterId::PatternStaleness => FilterGroup::AdaptiveRisk,
            FilterId::LiquiditySweep
            | FilterId::RetailTrap
            | FilterId::BreakOfStructure
            | FilterId::Divergence
            | FilterId::ZoneAlignment
            | FilterId::PatternStrength
            | FilterId::TrendMomentum => FilterGroup::Structural,
            FilterId::PatternWinRate
            | FilterId::SelfTuned
            | FilterId::RegimeStrategy
            | FilterId::MlConsensus => FilterGroup::Meta,
        }
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterResult {
    pub id: FilterId,
    /// Enabled in the registry and not abstaining this bar.
    pub active: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfluenceReport {
    pub score: usize,
    pub active: usize,
    pub required: usize,
    pub decision: Decision,
    pub direction: Option<Direction>,
    pub passed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    pub abstained: Vec<&'static str>,
    pub results: Vec<FilterResult>,
}

impl ConfluenceReport {
    /// Passing share of the active filters; 0 when nothing is active.
    pub fn ratio(&self) -> f64 {
        if self.active == 0 {
            0.0
        } else {
            self.score as f64 / self.active as f64
        }
    }

    pub fn meets_threshold(&self) -> bool {
        self.active > 0 && self.score >= self.required
    }

    pub fn is_passed(&self, id: FilterId) -> bool {
        self.results.iter().any(|r| r.id == id && r.active && r.passed)
    }
}

struct FilterEntry {
    id: FilterId,
    enabled: bool,
    predicate: Predicate,
}

pub struct FilterRegistry {
    entries: Vec<FilterEntry>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl FilterRegistry {
    pub fn new(disabled: &[FilterId]) -> Self {
        let entries = FilterId::ALL
            .iter()
            .map(|&id| FilterEntry {
                id,
                enabled: !disabled.contains(&id),
                predicate: predicates::predicate_for(id),
            })
            .collect();
        Self { entries }
    }

    /// Replace the predicate behind `id`. Used to plug in alternative
    /// detectors without touching the registry's composition.
    pub fn with_predicate(mut self, id: FilterId, predicate: Predicate) -> Self {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.predicate = predicate;
        }
        self
    }

    pub fn set_active(&mut self, id: FilterId, active: bool) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            if e.enabled != active {
                debug!("Filter {} {}", id, if active { "enabled" } else { "disabled" });
            }
            e.enabled = active;
        }
    }

    pub fn is_active(&self, id: FilterId) -> bool {
        self.entries.iter().any(|e| e.id == id && e.enabled)
    }

    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        thresholds: &FilterThresholds,
        decision_cfg: &DecisionConfig,
        profile: &TradingProfile,
    ) -> ConfluenceReport {
        let mut results = Vec::with_capacity(self.entries.len());
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        let mut abstained = Vec::new();

        for entry in &self.entries {
            if !entry.enabled {
                results.push(FilterResult {
                    id: entry.id,
                    active: false,
                    passed: false,
                });
                continue;
            }
            match (entry.predicate)(snapshot, thresholds) {
                Some(ok) => {
                    if ok {
                        passed.push(entry.id.name());
                    } else {
                        failed.push(entry.id.name());
                    }
                    results.push(FilterResult {
                        id: entry.id,
                        active: true,
                        passed: ok,
                    });
                }
                None => {
                    abstained.push(entry.id.name());
                    results.push(FilterResult {
                        id: entry.id,
                        active: false,
                        passed: false,
                    });
                }
            }
        }

        let score = passed.len();
        let active = score + failed.len();
        let required = profile.min_confluence;

        let decision = if active == 0 {
            Decision::Skip
        } else if score >= required {
            Decision::Enter
        } else if score as f64 / active as f64 >= decision_cfg.wait_ratio {
            Decision::Wait
        } else {
            Decision::Skip
        };

        debug!(
            "Confluence {}/{} (need {}) -> {} | pass: {:?} fail: {:?}",
            score, active, required, decision, passed, failed
        );

        ConfluenceReport {
            score,
            active,
            required,
            decision,
            direction: snapshot.direction(),
            passed,
            failed,
            abstained,
            results,
        }
    }
}
