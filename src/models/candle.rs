use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    pub fn total_range(&self) -> f64 {
        self.high - self.low
    }

    /// Upper edge of the real body.
    pub fn body_top(&self) -> f64 {
        self.close.max(self.open)
    }

    pub fn body_bottom(&self) -> f64 {
        self.close.min(self.open)
    }

    fn true_range(&self, prev_close: Option<f64>) -> f64 {
        let hl = self.high - self.low;
        match prev_close {
            Some(pc) => hl.max((self.high - pc).abs()).max((self.low - pc).abs()),
            None => hl,
        }
    }
}

/// Oldest-first bar history with the handful of reductions the filters and
/// stop engine need.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.candles.get(index)
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn tail(&self, n: usize) -> CandleSeries {
        let start = self.candles.len().saturating_sub(n);
        CandleSeries::new(self.candles[start..].to_vec())
    }

    pub fn slice(&self, start: usize, end: usize) -> CandleSeries {
        let s = start.min(self.candles.len());
        let e = end.min(self.candles.len()).max(s);
        CandleSeries::new(self.candles[s..e].to_vec())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candle> {
        self.candles.iter()
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    pub fn push(&mut self, candle: Candle) {
        self.candles.push(candle);
    }

    pub fn highs_max(&self) -> f64 {
        self.candles
            .iter()
            .map(|c| c.high)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn lows_min(&self) -> f64 {
        self.candles
            .iter()
            .map(|c| c.low)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Simple average true range over the last `period` bars. Falls back to
    /// the last bar's range when history is shorter than the period.
    pub fn atr(&self, period: usize) -> f64 {
        if period == 0 || self.candles.is_empty() {
            return 0.0;
        }
        if self.candles.len() < period {
            return self.candles.last().map_or(0.0, |c| c.total_range());
        }

        let trs: Vec<f64> = self
            .candles
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let prev = if i == 0 { None } else { Some(self.candles[i - 1].close) };
                c.true_range(prev)
            })
            .collect();

        let window = &trs[trs.len() - period..];
        window.iter().sum::<f64>() / window.len() as f64
    }

    /// Exponential moving average of closes; `None` until `period` bars exist.
    pub fn ema(&self, period: usize) -> Option<f64> {
        if period == 0 || self.candles.len() < period {
            return None;
        }
        let k = 2.0 / (period as f64 + 1.0);
        let seed: f64 =
            self.candles[..period].iter().map(|c| c.close).sum::<f64>() / period as f64;
        Some(
            self.candles[period..]
                .iter()
                .fold(seed, |ema, c| c.close * k + ema * (1.0 - k)),
        )
    }

    pub fn avg_volume(&self, n: usize) -> f64 {
        let tail = &self.candles[self.candles.len().saturating_sub(n)..];
        if tail.is_empty() {
            return 0.0;
        }
        tail.iter().map(|c| c.volume).sum::<f64>() / tail.len() as f64
    }

    /// Aggregate into larger buckets (e.g. 5m bars into 1h for alignment checks).
    pub fn resample(&self, bucket: Duration) -> CandleSeries {
        let bucket_secs = bucket.as_secs() as i64;
        if self.candles.is_empty() || bucket_secs == 0 {
            return CandleSeries::default();
        }
        let mut out: Vec<Candle> = Vec::new();

        for candle in &self.candles {
            let ts = candle.timestamp.timestamp();
            let bucket_ts = DateTime::from_timestamp(ts - ts.rem_euclid(bucket_secs), 0)
                .unwrap_or(candle.timestamp);

            match out.last_mut() {
                Some(last) if last.timestamp == bucket_ts => {
                    last.high = last.high.max(candle.high);
                    last.low = last.low.min(candle.low);
                    last.close = candle.close;
                    last.volume += candle.volume;
                }
                _ => out.push(Candle {
                    timestamp: bucket_ts,
                    ..candle.clone()
                }),
            }
        }

        CandleSeries::new(out)
    }
}

impl std::ops::Index<usize> for CandleSeries {
    type Output = Candle;
    fn index(&self, index: usize) -> &Self::Output {
        &self.candles[index]
    }
}

impl<'a> IntoIterator for &'a CandleSeries {
    type Item = &'a Candle;
    type IntoIter = std::slice::Iter<'a, Candle>;
    fn into_iter(self) -> Self::IntoIter {
        self.candles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_candles;

    #[test]
    fn body_edges_ignore_direction() {
        let s = make_candles(&[(1.1000, 1.1015, 1.0995, 1.1010), (1.1010, 1.1012, 1.0990, 1.0995)]);
        assert!((s[0].body_top() - 1.1010).abs() < 1e-9);
        assert!((s[0].body_bottom() - 1.1000).abs() < 1e-9);
        assert!((s[1].body_top() - 1.1010).abs() < 1e-9);
        assert!((s[1].body_bottom() - 1.0995).abs() < 1e-9);
        assert!((s[1].total_range() - 0.0022).abs() < 1e-9);
    }

    #[test]
    fn atr_uses_true_range_with_gaps() {
        let s = make_candles(&[
            (1.1000, 1.1010, 1.0990, 1.1000),
            (1.1050, 1.1060, 1.1040, 1.1050), // gap up: TR = 1.1060 - 1.1000
        ]);
        let atr = s.atr(2);
        let expected = (0.0020 + 0.0060) / 2.0;
        assert!((atr - expected).abs() < 1e-9);
    }

    #[test]
    fn atr_short_history_falls_back_to_last_range() {
        let s = make_candles(&[(1.0, 1.5, 0.5, 1.2)]);
        assert!((s.atr(14) - 1.0).abs() < 1e-9);
        assert_eq!(CandleSeries::default().atr(14), 0.0);
    }

    #[test]
    fn ema_needs_full_period() {
        let s = make_candles(&[(1.0, 1.0, 1.0, 1.0), (2.0, 2.0, 2.0, 2.0)]);
        assert!(s.ema(3).is_none());
        let ema = s.ema(2).unwrap();
        assert!((ema - 1.5).abs() < 1e-9);
    }

    #[test]
    fn resample_1m_to_5m() {
        let data: Vec<(f64, f64, f64, f64)> = (0..10)
            .map(|i| {
                let v = 100.0 + i as f64;
                (v, v + 2.0, v - 1.0, v + 1.0)
            })
            .collect();
        let s = make_candles(&data);
        let r = s.resample(Duration::from_secs(300));
        assert_eq!(r.len(), 2);
        assert!((r[0].open - 100.0).abs() < 1e-9);
        assert!((r[0].close - 105.0).abs() < 1e-9);
        assert!((r[1].high - 111.0).abs() < 1e-9);
    }

    #[test]
    fn slice_clamps_bounds() {
        let s = make_candles(&[(1.0, 1.0, 1.0, 1.0); 3]);
        assert_eq!(s.slice(2, 10).len(), 1);
        assert_eq!(s.slice(5, 2).len(), 0);
        assert_eq!(s.tail(10).len(), 3);
    }
}
