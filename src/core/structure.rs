use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CandleSeries, Direction, SwingType, Trend};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwingPoint {
    pub swing_type: SwingType,
    pub index: usize,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub broken: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BosEvent {
    pub direction: Direction,
    pub level: f64,
    pub index: usize,
    pub timestamp: DateTime<Utc>,
}

/// Swing/BOS bookkeeping over one candle series.
pub struct MarketStructure {
    pub swing_lookback: usize,
    pub swing_highs: Vec<SwingPoint>,
    pub swing_lows: Vec<SwingPoint>,
    pub trend: Trend,
    pub bos_events: Vec<BosEvent>,
}

impl Default for MarketStructure {
    fn default() -> Self {
        Self::with_lookback(3)
    }
}

impl MarketStructure {
    pub fn with_lookback(swing_lookback: usize) -> Self {
        Self {
            swing_lookback: swing_lookback.max(1),
            swing_highs: Vec::new(),
            swing_lows: Vec::new(),
            trend: Trend::Neutral,
            bos_events: Vec::new(),
        }
    }

    pub fn analyze(&mut self, candles: &CandleSeries) -> Trend {
        self.swing_highs.clear();
        self.swing_lows.clear();
        self.bos_events.clear();

        self.find_swings(candles);
        self.detect_bos(candles);
        self.determine_trend();

        self.trend
    }

    /// Most recent BOS if it happened within the last `within_bars` bars.
    pub fn recent_bos(&self, candles: &CandleSeries, within_bars: usize) -> Option<&BosEvent> {
        let last_idx = candles.len().checked_sub(1)?;
        self.bos_events
            .last()
            .filter(|e| last_idx.saturating_sub(e.index) < within_bars)
    }

    fn find_swings(&mut self, candles: &CandleSeries) {
        let lb = self.swing_lookback;
        let len = candles.len();
        if len <= lb * 2 {
            return;
        }

        for i in lb..(len - lb) {
            let window = &candles.as_slice()[i - lb..=i + lb];
            let c = &candles[i];

            if window.iter().all(|w| w.high <= c.high) {
                self.swing_highs.push(SwingPoint {
                    swing_type: SwingType::High,
                    index: i,
                    price: c.high,
                    timestamp: c.timestamp,
                    broken: false,
                });
            }
            if window.iter().all(|w| w.low >= c.low) {
                self.swing_lows.push(SwingPoint {
                    swing_type: SwingType::Low,
                    index: i,
                    price: c.low,
                    timestamp: c.timestamp,
                    broken: false,
                });
            }
        }
    }

    fn detect_bos(&mut self, candles: &CandleSeries) {
        for i in 1..candles.len() {
            let close = candles[i].close;
            let ts = candles[i].timestamp;

            // Close above the latest unbroken swing high
            if let Some(sh) = self
                .swing_highs
                .iter_mut()
                .filter(|s| s.index + self.swing_lookback <= i && !s.broken)
                .max_by_key(|s| s.index)
            {
                if close > sh.price {
                    sh.broken = true;
                    self.bos_events.push(BosEvent {
                        direction: Direction::Long,
                        level: sh.price,
                        index: i,
                        timestamp: ts,
                    });
                }
            }

            // Close below the latest unbroken swing low
            if let Some(sl) = self
                .swing_lows
                .iter_mut()
                .filter(|s| s.index + self.swing_lookback <= i && !s.broken)
                .max_by_key(|s| s.index)
            {
                if close < sl.price {
                    sl.broken = true;
                    self.bos_events.push(BosEvent {
                        direction: Direction::Short,
                        level: sl.price,
                        index: i,
                        timestamp: ts,
                    });
                }
            }
        }
    }

    fn determine_trend(&mut self) {
        let recent_count = self.bos_events.len().min(3);
        let recent = &self.bos_events[self.bos_events.len() - recent_count..];
        let bullish = recent.iter().filter(|e| e.direction == Direction::Long).count();
        let bearish = recent_count - bullish;

        self.trend = if recent_count == 0 || bullish == bearish {
            Trend::Neutral
        } else if bullish > bearish {
            Trend::Bullish
        } else {
            Trend::Bearish
        };
    }
}

/// Last bar wicks through the extreme of the prior `lookback` bars and closes
/// back inside. A sweep of lows is a long setup; a sweep of highs is short.
pub fn liquidity_sweep(candles: &CandleSeries, lookback: usize) -> Option<Direction> {
    let n = candles.len();
    if n < lookback + 1 || lookback == 0 {
        return None;
    }
    let last = &candles[n - 1];
    let prior = candles.slice(n - 1 - lookback, n - 1);
    let prior_low = prior.lows_min();
    let prior_high = prior.highs_max();

    if last.low < prior_low && last.close > prior_low {
        Some(Direction::Long)
    } else if last.high > prior_high && last.close < prior_high {
        Some(Direction::Short)
    } else {
        None
    }
}

/// Failed breakout: the previous bar closed beyond the range of the
/// `lookback` bars before it and the last bar closed back inside. Returns the
/// direction that profits from the trapped side (a failed upside breakout is
/// a short).
pub fn retail_trap(candles: &CandleSeries, lookback: usize) -> Option<Direction> {
    let n = candles.len();
    if n < lookback + 2 || lookback == 0 {
        return None;
    }
    let breakout = &candles[n - 2];
    let last = &candles[n - 1];
    let range = candles.slice(n - 2 - lookback, n - 2);
    let high = range.highs_max();
    let low = range.lows_min();

    if breakout.close > high && last.close < high {
        Some(Direction::Short)
    } else if breakout.close < low && last.close > low {
        Some(Direction::Long)
    } else {
        None
    }
}

/// Wilder RSI of closes; `None` with fewer than `period + 1` bars.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let mut gain = 0.0;
    let mut loss = 0.0;
    for w in closes[..=period].windows(2) {
        let d = w[1] - w[0];
        if d > 0.0 {
            gain += d;
        } else {
            loss -= d;
        }
    }
    gain /= period as f64;
    loss /= period as f64;

    for w in closes[period..].windows(2) {
        let d = w[1] - w[0];
        gain = (gain * (period as f64 - 1.0) + d.max(0.0)) / period as f64;
        loss = (loss * (period as f64 - 1.0) + (-d).max(0.0)) / period as f64;
    }

    if loss == 0.0 {
        return Some(100.0);
    }
    Some(100.0 - 100.0 / (1.0 + gain / loss))
}

/// Regular RSI divergence between the last close and the extreme close of the
/// preceding `lookback` bars.
pub fn rsi_divergence(candles: &CandleSeries, lookback: usize, period: usize) -> Option<Direction> {
    let closes = candles.closes();
    let n = closes.len();
    if n < lookback + period + 2 {
        return None;
    }

    let window_start = n - 1 - lookback;
    let (mut lo_idx, mut hi_idx) = (window_start, window_start);
    for i in window_start..n - 1 {
        if closes[i] < closes[lo_idx] {
            lo_idx = i;
        }
        if closes[i] > closes[hi_idx] {
            hi_idx = i;
        }
    }

    let rsi_now = rsi(&closes, period)?;
    let last = closes[n - 1];

    // Lower low in price, higher low in momentum
    if last < closes[lo_idx] {
        let rsi_then = rsi(&closes[..=lo_idx], period)?;
        if rsi_now > rsi_then {
            return Some(Direction::Long);
        }
    }
    if last > closes[hi_idx] {
        let rsi_then = rsi(&closes[..=hi_idx], period)?;
        if rsi_now < rsi_then {
            return Some(Direction::Short);
        }
    }
    None
}
