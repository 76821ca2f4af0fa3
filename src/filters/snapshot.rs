use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::core::sessions::SessionManager;
use crate::models::{Direction, MarketRegime, Trend};
use crate::signals::{MarketData, MlSignal, PatternSignal, StructureSignals, ZoneSignal};
use crate::trading::stats::PatternStats;

/// Bars used for the slow ATR the volatility regime is measured against.
const ATR_BASELINE_BARS: usize = 100;

/// Everything the filter predicates may read for one bar. Assembled once at
/// the start of a pass and never mutated by the filters.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub data: MarketData,
    pub pip_size: f64,
    pub atr: f64,
    pub atr_baseline: f64,
    pub regime: MarketRegime,

    pub pattern: Option<PatternSignal>,
    pub zones: ZoneSignal,
    pub structure: StructureSignals,
    /// `None` when the model is disabled or did not answer in time.
    pub ml: Option<MlSignal>,

    pub session: String,
    pub in_trade_session: bool,
    pub market_open: bool,
    pub news_events: Vec<DateTime<Utc>>,

    /// Live positions already leaning the same way as the candidate.
    pub same_side_exposure: usize,
    /// Expected fill slippage in price units.
    pub expected_slippage: f64,
    pub pattern_stats: Option<PatternStats>,
    pub tuned_min_strength: Option<f64>,

    pub pattern_validity: Duration,
    /// Stop-out time of a matching re-entry ticket; restarts the staleness clock.
    pub reentry_since: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    pub fn new(data: MarketData, cfg: &Config) -> Self {
        let atr = data.candles.atr(cfg.decision.atr_period);
        let atr_baseline = data.candles.atr(ATR_BASELINE_BARS.min(data.candles.len().max(1)));
        let session = SessionManager::session_at(cfg, data.now);
        let in_trade_session = cfg.trade_sessions.iter().any(|s| *s == session);
        let market_open = SessionManager::is_market_open(data.now);
        let expected_slippage = data.quote.spread() / 2.0;

        Self {
            pip_size: cfg.instrument.pip_size,
            atr,
            atr_baseline,
            regime: MarketRegime::Ranging,
            pattern: None,
            zones: ZoneSignal::default(),
            structure: StructureSignals::default(),
            ml: None,
            session,
            in_trade_session,
            market_open,
            news_events: Vec::new(),
            same_side_exposure: 0,
            expected_slippage,
            pattern_stats: None,
            tuned_min_strength: None,
            pattern_validity: cfg.profile.pattern_validity(),
            reentry_since: None,
            data,
        }
        .with_regime(cfg)
    }

    fn with_regime(mut self, cfg: &Config) -> Self {
        self.regime = classify_regime(
            self.atr,
            self.atr_baseline,
            self.structure.trend,
            cfg.filters.min_atr_ratio,
            cfg.filters.max_atr_ratio,
        );
        self
    }

    pub fn with_pattern(mut self, pattern: Option<PatternSignal>) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_zones(mut self, zones: ZoneSignal) -> Self {
        self.zones = zones;
        self
    }

    /// Structure changes the regime (trend), so it is reclassified here.
    pub fn with_structure(mut self, structure: StructureSignals, cfg: &Config) -> Self {
        self.structure = structure;
        self.with_regime(cfg)
    }

    pub fn with_ml(mut self, ml: Option<MlSignal>) -> Self {
        self.ml = ml;
        self
    }

    pub fn with_news(mut self, events: Vec<DateTime<Utc>>) -> Self {
        self.news_events = events;
        self
    }

    pub fn with_exposure(mut self, same_side: usize) -> Self {
        self.same_side_exposure = same_side;
        self
    }

    pub fn with_pattern_stats(mut self, stats: Option<PatternStats>, tuned_min_strength: Option<f64>) -> Self {
        self.pattern_stats = stats;
        self.tuned_min_strength = tuned_min_strength;
        self
    }

    pub fn with_reentry_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.reentry_since = since;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.data.now
    }

    /// Candidate trade direction: the active pattern's.
    pub fn direction(&self) -> Option<Direction> {
        self.pattern.as_ref().map(|p| p.direction)
    }

    pub fn spread_pips(&self) -> f64 {
        self.data.quote.spread() / self.pip_size
    }

    /// Age of the active setup. A matching re-entry ticket counts as a fresh
    /// sighting of the pattern at its stop-out time.
    pub fn pattern_age(&self) -> Option<Duration> {
        let detected = self.pattern.as_ref()?.detected_at;
        let reference = match self.reentry_since {
            Some(t) if t > detected => t,
            _ => detected,
        };
        Some(self.now() - reference)
    }

    pub fn pattern_is_fresh(&self) -> bool {
        self.pattern_age().is_some_and(|age| age <= self.pattern_validity)
    }

    pub fn news_within(&self, minutes: i64) -> bool {
        let window = Duration::minutes(minutes);
        let now = self.now();
        self.news_events
            .iter()
            .any(|&t| t - now <= window && now - t <= window)
    }
}

pub fn classify_regime(atr: f64, baseline: f64, trend: Trend, min_ratio: f64, max_ratio: f64) -> MarketRegime {
    if baseline > 0.0 {
        let ratio = atr / baseline;
        if ratio > max_ratio {
            return MarketRegime::Volatile;
        }
        if ratio < min_ratio {
            return MarketRegime::Quiet;
        }
    }
    match trend {
        Trend::Neutral => MarketRegime::Ranging,
        _ => MarketRegime::Trending,
    }
}
