//! One pure function per filter. `Some(pass)` when the filter has an
//! opinion, `None` when its input is missing for this bar.

use crate::config::FilterThresholds;
use crate::filters::{FilterId, MarketSnapshot};
use crate::models::{Decision, MarketRegime};

pub type Predicate = fn(&MarketSnapshot, &FilterThresholds) -> Option<bool>;

const VOLUME_AVG_BARS: usize = 20;
const CONTINUATION_PATTERNS: [&str; 1] = ["bos_continuation"];

pub fn predicate_for(id: FilterId) -> Predicate {
    match id {
        FilterId::Spread => spread,
        FilterId::Volume => volume,
        FilterId::Slippage => slippage,
        FilterId::Session => session,
        FilterId::HtfAlignment => htf_alignment,
        FilterId::Correlation => correlation,
        FilterId::NewsBlackout => news_blackout,
        FilterId::VolatilityRegime => volatility_regime,
        FilterId::PatternStaleness => pattern_staleness,
        FilterId::LiquiditySweep => liquidity_sweep,
        FilterId::RetailTrap => retail_trap,
        FilterId::BreakOfStructure => break_of_structure,
        FilterId::Divergence => divergence,
        FilterId::PatternWinRate => pattern_win_rate,
        FilterId::SelfTuned => self_tuned,
        FilterId::RegimeStrategy => regime_strategy,
        FilterId::ZoneAlignment => zone_alignment,
        FilterId::PatternStrength => pattern_strength,
        FilterId::MlConsensus => ml_consensus,
        FilterId::TrendMomentum => trend_momentum,
    }
}

// --- execution quality ---

pub fn spread(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    Some(s.spread_pips() <= t.max_spread_pips)
}

/// Tick volume is optional on FX feeds; no volume history means no opinion.
pub fn volume(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    let candles = &s.data.candles;
    let last = candles.last()?;
    let avg = candles.avg_volume(VOLUME_AVG_BARS);
    if avg <= 0.0 {
        return None;
    }
    Some(last.volume >= avg * t.min_volume_ratio)
}

pub fn slippage(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    Some(s.expected_slippage / s.pip_size <= t.max_slippage_pips)
}

// --- context ---

pub fn session(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    Some(s.market_open && s.in_trade_session)
}

pub fn htf_alignment(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    let dir = s.direction()?;
    if let Some(htf) = &s.data.htf_candles {
        if let (Some(ema), Some(last)) = (htf.ema(t.htf_ema_period), htf.last()) {
            return Some(dir.is_better(last.close, ema));
        }
    }
    s.structure.htf_trend.to_direction().map(|d| d == dir)
}

pub fn correlation(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    Some(s.same_side_exposure < t.max_correlated_positions)
}

pub fn news_blackout(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    Some(!s.news_within(t.news_blackout_minutes))
}

// --- adaptive risk ---

pub fn volatility_regime(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    if s.atr_baseline <= 0.0 {
        return None;
    }
    let ratio = s.atr / s.atr_baseline;
    Some(ratio >= t.min_atr_ratio && ratio <= t.max_atr_ratio)
}

pub fn pattern_staleness(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    s.pattern.as_ref()?;
    Some(s.pattern_is_fresh())
}

// --- structural ---

pub fn liquidity_sweep(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    let dir = s.direction()?;
    Some(s.structure.liquidity_sweep == Some(dir))
}

pub fn retail_trap(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    let dir = s.direction()?;
    Some(s.structure.retail_trap == Some(dir))
}

/// A fresh break in the trade's direction, or an established trend that agrees.
pub fn break_of_structure(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    let dir = s.direction()?;
    let bias = s
        .structure
        .break_of_structure
        .or_else(|| s.structure.trend.to_direction());
    Some(bias == Some(dir))
}

/// Fails only on divergence against the trade.
pub fn divergence(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    let dir = s.direction()?;
    Some(s.structure.divergence != Some(dir.opposite()))
}

pub fn zone_alignment(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    let dir = s.direction()?;
    if s.zones.demand.is_none() && s.zones.supply.is_none() {
        return None;
    }
    let price = s.data.quote.mid();
    Some(s.zones.supporting(dir).is_some() && !s.zones.inside_opposing(dir, price))
}

pub fn pattern_strength(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    let p = s.pattern.as_ref()?;
    Some(p.strength >= t.min_pattern_strength)
}

pub fn trend_momentum(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    let dir = s.direction()?;
    let ema = s.data.candles.ema(t.htf_ema_period)?;
    let last = s.data.candles.last()?;
    Some(dir.is_better(last.close, ema))
}

// --- meta ---

/// Abstains until the pattern has enough closed trades to judge.
pub fn pattern_win_rate(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    let stats = s.pattern_stats.as_ref()?;
    if stats.trades < t.min_pattern_samples {
        return None;
    }
    Some(stats.win_rate() >= t.min_pattern_win_rate)
}

pub fn self_tuned(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    let p = s.pattern.as_ref()?;
    let min = s.tuned_min_strength?;
    Some(p.strength >= min)
}

/// Reversal setups belong to ranging tape, continuation setups to trends;
/// nothing fits volatile or dead markets.
pub fn regime_strategy(s: &MarketSnapshot, _t: &FilterThresholds) -> Option<bool> {
    let p = s.pattern.as_ref()?;
    let continuation = CONTINUATION_PATTERNS.contains(&p.name.as_str());
    Some(match s.regime {
        MarketRegime::Trending => {
            continuation || s.structure.trend.to_direction() == Some(p.direction)
        }
        MarketRegime::Ranging => !continuation,
        MarketRegime::Volatile | MarketRegime::Quiet => false,
    })
}

/// Fail-open: a missing or zero-confidence model answer abstains.
pub fn ml_consensus(s: &MarketSnapshot, t: &FilterThresholds) -> Option<bool> {
    let ml = s.ml.filter(|m| !m.is_neutral())?;
    Some(ml.signal == Decision::Enter && ml.probability >= t.ml_min_probability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Quote, Trend};
    use crate::signals::{MlSignal, PatternSignal, PriceZone, StructureSignals, ZoneSignal};
    use crate::test_helpers::{default_test_config, neutral_snapshot};
    use crate::trading::stats::PatternStats;

    fn with_long_pattern(s: MarketSnapshot, strength: f64) -> MarketSnapshot {
        let at = s.now();
        s.with_pattern(Some(PatternSignal {
            name: "liquidity_sweep".to_string(),
            strength,
            direction: Direction::Long,
            detected_at: at,
        }))
    }

    #[test]
    fn spread_in_pips() {
        let cfg = default_test_config();
        let mut s = neutral_snapshot(&cfg);
        s.data.quote = Quote::new(1.10000, 1.10020, s.now());
        assert_eq!(spread(&s, &cfg.filters), Some(true));
        s.data.quote = Quote::new(1.10000, 1.10040, s.now());
        assert_eq!(spread(&s, &cfg.filters), Some(false));
    }

    #[test]
    fn direction_filters_abstain_without_pattern() {
        let cfg = default_test_config();
        let s = neutral_snapshot(&cfg);
        for id in [
            FilterId::LiquiditySweep,
            FilterId::RetailTrap,
            FilterId::BreakOfStructure,
            FilterId::PatternStrength,
            FilterId::PatternStaleness,
        ] {
            assert_eq!(predicate_for(id)(&s, &cfg.filters), None, "{}", id);
        }
    }

    #[test]
    fn sweep_must_match_direction() {
        let cfg = default_test_config();
        let base = with_long_pattern(neutral_snapshot(&cfg), 0.7);
        let long = base.clone().with_structure(
            StructureSignals {
                liquidity_sweep: Some(Direction::Long),
                ..StructureSignals::default()
            },
            &cfg,
        );
        assert_eq!(liquidity_sweep(&long, &cfg.filters), Some(true));
        let short = base.with_structure(
            StructureSignals {
                liquidity_sweep: Some(Direction::Short),
                ..StructureSignals::default()
            },
            &cfg,
        );
        assert_eq!(liquidity_sweep(&short, &cfg.filters), Some(false));
    }

    #[test]
    fn divergence_only_fails_when_opposed() {
        let cfg = default_test_config();
        let s = with_long_pattern(neutral_snapshot(&cfg), 0.7);
        assert_eq!(divergence(&s, &cfg.filters), Some(true));
        let s = s.with_structure(
            StructureSignals {
                divergence: Some(Direction::Short),
                ..StructureSignals::default()
            },
            &cfg,
        );
        assert_eq!(divergence(&s, &cfg.filters), Some(false));
    }

    #[test]
    fn ml_fails_open() {
        let cfg = default_test_config();
        let s = neutral_snapshot(&cfg);
        assert_eq!(ml_consensus(&s, &cfg.filters), None);
        let s = s.with_ml(Some(MlSignal::neutral()));
        assert_eq!(ml_consensus(&s, &cfg.filters), None);
        let s = s.with_ml(Some(MlSignal {
            signal: Decision::Enter,
            probability: 0.7,
            confidence: 0.6,
        }));
        assert_eq!(ml_consensus(&s, &cfg.filters), Some(true));
    }

    #[test]
    fn win_rate_waits_for_samples() {
        let cfg = default_test_config();
        let thin = PatternStats {
            trades: 3,
            wins: 0,
            ..PatternStats::default()
        };
        let s = neutral_snapshot(&cfg).with_pattern_stats(Some(thin), None);
        assert_eq!(pattern_win_rate(&s, &cfg.filters), None);

        let losing = PatternStats {
            trades: 20,
            wins: 5,
            ..PatternStats::default()
        };
        let s = s.with_pattern_stats(Some(losing), None);
        assert_eq!(pattern_win_rate(&s, &cfg.filters), Some(false));
    }

    #[test]
    fn zone_alignment_rejects_inside_supply_for_longs() {
        let cfg = default_test_config();
        let mut s = with_long_pattern(neutral_snapshot(&cfg), 0.7);
        let price = s.data.quote.mid();
        s.zones = ZoneSignal {
            demand: Some(PriceZone {
                low: price - 0.0050,
                high: price - 0.0040,
            }),
            supply: Some(PriceZone {
                low: price - 0.0001,
                high: price + 0.0005,
            }),
            inside_zone: true,
        };
        assert_eq!(zone_alignment(&s, &cfg.filters), Some(false));
        s.zones.supply = None;
        s.zones.inside_zone = false;
        assert_eq!(zone_alignment(&s, &cfg.filters), Some(true));
    }

    #[test]
    fn regime_strategy_matches_pattern_family() {
        let cfg = default_test_config();
        let mut s = with_long_pattern(neutral_snapshot(&cfg), 0.7);
        s.regime = MarketRegime::Ranging;
        assert_eq!(regime_strategy(&s, &cfg.filters), Some(true));
        s.regime = MarketRegime::Trending;
        s.structure.trend = Trend::Bearish;
        assert_eq!(regime_strategy(&s, &cfg.filters), Some(false));
        s.regime = MarketRegime::Volatile;
        assert_eq!(regime_strategy(&s, &cfg.filters), Some(false));
    }
}
