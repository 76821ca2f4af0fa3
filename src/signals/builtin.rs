use async_trait::async_trait;

use crate::config::Config;
use crate::core::structure::{liquidity_sweep, retail_trap, rsi_divergence, MarketStructure};
use crate::error::SignalError;
use crate::models::{CandleSeries, Direction};
use crate::signals::{MarketData, PatternSignal, PriceZone, SignalProvider, StructureSignals, ZoneSignal};

const RSI_PERIOD: usize = 14;
const BOS_RECENCY_BARS: usize = 3;

/// Evaluate the structural detectors over the entry and higher timeframe bars.
pub fn structure_signals(data: &MarketData, cfg: &Config) -> StructureSignals {
    let lookback = cfg.filters.sweep_lookback;
    let mut ms = MarketStructure::with_lookback(cfg.decision.swing_lookback);
    let trend = ms.analyze(&data.candles);
    let break_of_structure = ms
        .recent_bos(&data.candles, BOS_RECENCY_BARS)
        .map(|e| e.direction);

    let htf_trend = data
        .htf_candles
        .as_ref()
        .map(|htf| MarketStructure::with_lookback(cfg.decision.swing_lookback).analyze(htf))
        .unwrap_or(crate::models::Trend::Neutral);

    StructureSignals {
        liquidity_sweep: liquidity_sweep(&data.candles, lookback),
        retail_trap: retail_trap(&data.candles, lookback),
        break_of_structure,
        divergence: rsi_divergence(&data.candles, cfg.filters.divergence_lookback, RSI_PERIOD),
        trend,
        htf_trend,
    }
}

/// Default pattern source: a liquidity sweep, a failed breakout, or a fresh
/// break of structure in trend. The last detection keeps being reported
/// (with its original time) until a new one replaces it, so staleness checks
/// downstream see its true age.
pub struct StructurePatternDetector {
    swing_lookback: usize,
    sweep_lookback: usize,
    last: Option<PatternSignal>,
}

impl StructurePatternDetector {
    pub fn new(cfg: &Config) -> Self {
        Self {
            swing_lookback: cfg.decision.swing_lookback,
            sweep_lookback: cfg.filters.sweep_lookback,
            last: None,
        }
    }

    pub fn detect(&mut self, data: &MarketData) -> Option<PatternSignal> {
        let candles = &data.candles;
        let at = candles.last()?.timestamp;

        let fresh = if let Some(dir) = liquidity_sweep(candles, self.sweep_lookback) {
            let divergence = rsi_divergence(candles, self.sweep_lookback, RSI_PERIOD);
            let strength = if divergence == Some(dir) { 0.85 } else { 0.65 };
            Some(("liquidity_sweep", dir, strength))
        } else if let Some(dir) = retail_trap(candles, self.sweep_lookback) {
            Some(("retail_trap", dir, 0.6))
        } else {
            let mut ms = MarketStructure::with_lookback(self.swing_lookback);
            let trend = ms.analyze(candles);
            ms.recent_bos(candles, 1)
                .filter(|e| trend.to_direction() == Some(e.direction))
                .map(|e| ("bos_continuation", e.direction, 0.55))
        };

        if let Some((name, direction, strength)) = fresh {
            self.last = Some(PatternSignal {
                name: name.to_string(),
                strength,
                direction,
                detected_at: at,
            });
        }
        self.last.clone()
    }
}

#[async_trait]
impl SignalProvider for StructurePatternDetector {
    type Output = Option<PatternSignal>;

    fn name(&self) -> &'static str {
        "structure_pattern"
    }

    async fn request(&mut self, data: &MarketData) -> Result<Self::Output, SignalError> {
        Ok(self.detect(data))
    }
}

/// Supply/demand zones from the base of the nearest unbroken swings.
pub struct SwingZoneDetector {
    swing_lookback: usize,
}

impl SwingZoneDetector {
    pub fn new(cfg: &Config) -> Self {
        Self {
            swing_lookback: cfg.decision.swing_lookback,
        }
    }

    pub fn detect(&self, candles: &CandleSeries, price: f64) -> ZoneSignal {
        let mut ms = MarketStructure::with_lookback(self.swing_lookback);
        ms.analyze(candles);

        let demand = ms
            .swing_lows
            .iter()
            .filter(|s| !s.broken && s.price <= price)
            .max_by(|a, b| a.price.total_cmp(&b.price))
            .map(|s| {
                let c = &candles[s.index];
                PriceZone {
                    low: c.low,
                    high: c.body_bottom(),
                }
            });
        let supply = ms
            .swing_highs
            .iter()
            .filter(|s| !s.broken && s.price >= price)
            .min_by(|a, b| a.price.total_cmp(&b.price))
            .map(|s| {
                let c = &candles[s.index];
                PriceZone {
                    low: c.body_top(),
                    high: c.high,
                }
            });

        let inside_zone = demand.is_some_and(|z| z.contains(price))
            || supply.is_some_and(|z| z.contains(price));

        ZoneSignal {
            demand,
            supply,
            inside_zone,
        }
    }
}

#[async_trait]
impl SignalProvider for SwingZoneDetector {
    type Output = ZoneSignal;

    fn name(&self) -> &'static str {
        "swing_zones"
    }

    async fn request(&mut self, data: &MarketData) -> Result<Self::Output, SignalError> {
        Ok(self.detect(&data.candles, data.quote.mid()))
    }
}

/// Direction a set of structure signals leans, by simple majority.
pub fn structural_bias(signals: &StructureSignals) -> Option<Direction> {
    let votes = [
        signals.liquidity_sweep,
        signals.retail_trap,
        signals.break_of_structure,
        signals.divergence,
        signals.trend.to_direction(),
        signals.htf_trend.to_direction(),
    ];
    let longs = votes.iter().filter(|v| **v == Some(Direction::Long)).count();
    let shorts = votes.iter().filter(|v| **v == Some(Direction::Short)).count();
    match longs.cmp(&shorts) {
        std::cmp::Ordering::Greater => Some(Direction::Long),
        std::cmp::Ordering::Less => Some(Direction::Short),
        std::cmp::Ordering::Equal => None,
    }
}
