use serde::{Deserialize, Serialize};

use crate::core::structure::MarketStructure;
use crate::models::{CandleSeries, Direction, StopMode};

/// Structural stops further than this many ATRs are ignored in favor of the
/// ATR fallback.
const MAX_STRUCTURAL_ATR: f64 = 4.0;
/// Structural stops closer than this many ATRs sit inside the noise.
const MIN_STRUCTURAL_ATR: f64 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLevel {
    pub price: f64,
    pub mode: StopMode,
    pub reason: String,
}

pub struct StopLossEngine {
    pub swing_lookback: usize,
    pub buffer: f64,
}

impl StopLossEngine {
    /// `buffer` is an absolute price distance added beyond the invalidating level.
    pub fn new(swing_lookback: usize, buffer: f64) -> Self {
        Self {
            swing_lookback,
            buffer,
        }
    }

    /// Stop beyond the nearest level that would invalidate the trade: the
    /// closest confirmed swing (or supplied zone edge) on the losing side of
    /// `entry`, falling back to `atr * atr_mult` when none is usable.
    pub fn initial_stop(
        &self,
        entry: f64,
        direction: Direction,
        candles: &CandleSeries,
        zone_level: Option<f64>,
        atr: f64,
        atr_mult: f64,
    ) -> StopLevel {
        let mut candidates: Vec<(f64, StopMode)> = self
            .protective_swings(candles, direction)
            .into_iter()
            .map(|p| (p, StopMode::Structural))
            .collect();
        if let Some(z) = zone_level {
            candidates.push((z, StopMode::Zone));
        }

        let usable = candidates.into_iter().filter(|(level, _)| {
            let dist = (entry - level) * direction.sign();
            atr <= 0.0 || (dist >= atr * MIN_STRUCTURAL_ATR && dist <= atr * MAX_STRUCTURAL_ATR)
        });

        // Nearest invalidating level = the one closest to entry on the losing side
        let nearest = usable.fold(None::<(f64, StopMode)>, |best, cand| match best {
            Some(b) if !direction.is_better(cand.0, b.0) => Some(b),
            _ => Some(cand),
        });

        match nearest {
            Some((level, mode)) => {
                let price = level - direction.sign() * self.buffer;
                StopLevel {
                    price,
                    mode,
                    reason: format!("{} level {:.5} + buffer -> {:.5}", mode, level, price),
                }
            }
            None => {
                let price = entry - direction.sign() * (atr * atr_mult + self.buffer);
                StopLevel {
                    price,
                    mode: StopMode::Atr,
                    reason: format!("FALLBACK: {:.1} x ATR {:.5} -> {:.5}", atr_mult, atr, price),
                }
            }
        }
    }

    /// Candidate trailing stop for a position currently marked at `price`.
    /// Returns `None` unless the candidate improves on `current_stop`; the
    /// caller can apply the result without re-checking monotonicity.
    pub fn trailing_stop(
        &self,
        direction: Direction,
        current_stop: f64,
        price: f64,
        candles: &CandleSeries,
        atr: f64,
        atr_mult: f64,
        structural: bool,
    ) -> Option<f64> {
        let atr_candidate = price - direction.sign() * atr * atr_mult;

        let structural_candidate = if structural {
            self.protective_swings(candles, direction)
                .into_iter()
                .map(|level| level - direction.sign() * self.buffer)
                .filter(|stop| direction.is_better(price, *stop))
                .fold(None::<f64>, |best, s| match best {
                    Some(b) if !direction.is_better(s, b) => Some(b),
                    _ => Some(s),
                })
        } else {
            None
        };

        let candidate = structural_candidate.unwrap_or(atr_candidate);
        if direction.is_better(candidate, current_stop) && direction.is_better(price, candidate) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Confirmed swing levels on the protective side: swing lows for longs,
    /// swing highs for shorts, only those not yet broken by a close.
    fn protective_swings(&self, candles: &CandleSeries, direction: Direction) -> Vec<f64> {
        let mut ms = MarketStructure::with_lookback(self.swing_lookback);
        ms.analyze(candles);
        let last_close = match candles.last() {
            Some(c) => c.close,
            None => return Vec::new(),
        };

        let swings = match direction {
            Direction::Long => &ms.swing_lows,
            Direction::Short => &ms.swing_highs,
        };
        swings
            .iter()
            .filter(|s| !s.broken && direction.is_better(last_close, s.price))
            .map(|s| s.price)
            .collect()
    }
}
