use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::exchange::MarketFeed;
use crate::models::{Candle, CandleSeries, Quote, Timeframe};
use crate::signals::MarketData;

/// Replays stored bars one at a time. A cursor (`now`) controls what is
/// visible: only candles with timestamp <= now are returned, simulating a
/// forward walk with no look-ahead.
pub struct HistoricalFeed {
    symbol: String,
    timeframe: Timeframe,
    candles: Vec<Candle>,
    htf: Option<Vec<Candle>>,
    lookback: usize,
    half_spread: f64,
    now: Option<DateTime<Utc>>,
    cursor: usize,
}

impl HistoricalFeed {
    /// Candles must be sorted oldest-first.
    pub fn new(symbol: &str, timeframe: Timeframe, candles: Vec<Candle>, lookback: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            candles,
            htf: None,
            lookback,
            half_spread: 0.0,
            now: None,
            cursor: 0,
        }
    }

    /// Higher-timeframe bars. Without them the entry bars are resampled.
    pub fn with_htf(mut self, candles: Vec<Candle>) -> Self {
        self.htf = Some(candles);
        self
    }

    /// Synthetic bid/ask spread around each close, in price units.
    pub fn with_spread(mut self, spread: f64) -> Self {
        self.half_spread = spread.max(0.0) / 2.0;
        self
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.candles.len().saturating_sub(self.cursor)
    }

    pub fn current_time(&self) -> Option<DateTime<Utc>> {
        self.now
    }

    pub fn earliest_time(&self) -> Option<DateTime<Utc>> {
        self.candles.first().map(|c| c.timestamp)
    }

    pub fn latest_time(&self) -> Option<DateTime<Utc>> {
        self.candles.last().map(|c| c.timestamp)
    }

    /// Jump the cursor; the next snapshot is the first bar after `t`.
    pub fn set_time(&mut self, t: DateTime<Utc>) {
        self.now = Some(t);
        self.cursor = self.candles.partition_point(|c| c.timestamp <= t);
    }

    fn visible(all: &[Candle], now: DateTime<Utc>, limit: usize) -> CandleSeries {
        // Binary search for the rightmost candle <= now
        let end = match all.partition_point(|c| c.timestamp <= now) {
            0 => return CandleSeries::default(),
            n => n,
        };
        let start = end.saturating_sub(limit);
        CandleSeries::new(all[start..end].to_vec())
    }

    fn htf_view(&self, now: DateTime<Utc>, candles: &CandleSeries) -> Option<CandleSeries> {
        match &self.htf {
            Some(htf) => Some(Self::visible(htf, now, self.lookback)),
            None => self
                .timeframe
                .higher()
                .map(|tf| candles.resample(tf.as_duration())),
        }
    }
}

#[async_trait]
impl MarketFeed for HistoricalFeed {
    async fn next_snapshot(&mut self) -> Result<Option<MarketData>> {
        let Some(bar) = self.candles.get(self.cursor) else {
            return Ok(None);
        };
        let now = bar.timestamp;
        let close = bar.close;
        self.cursor += 1;
        self.now = Some(now);

        let candles = Self::visible(&self.candles, now, self.lookback);
        let htf_candles = self.htf_view(now, &candles);
        Ok(Some(MarketData {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            candles,
            htf_candles,
            quote: Quote::new(close - self.half_spread, close + self.half_spread, now),
            now,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_bullish_trend;

    fn feed(n: usize, lookback: usize) -> HistoricalFeed {
        let bars = make_bullish_trend(n, 100.0).as_slice().to_vec();
        HistoricalFeed::new("TEST", Timeframe::M1, bars, lookback)
    }

    #[tokio::test]
    async fn walks_forward_without_look_ahead() {
        let mut f = feed(5, 3);
        let first = f.next_snapshot().await.unwrap().unwrap();
        assert_eq!(first.candles.len(), 1);
        assert_eq!(first.quote.mid(), first.candles.last().unwrap().close);

        let mut last = first;
        while let Some(snap) = f.next_snapshot().await.unwrap() {
            assert!(snap.candles.len() <= 3);
            assert_eq!(snap.candles.last().unwrap().timestamp, snap.now);
            last = snap;
        }
        assert_eq!(Some(last.now), f.latest_time());
        assert_eq!(f.remaining(), 0);
    }

    #[tokio::test]
    async fn set_time_skips_ahead() {
        let mut f = feed(10, 50);
        let t = f.earliest_time().unwrap() + chrono::Duration::minutes(4);
        f.set_time(t);
        let snap = f.next_snapshot().await.unwrap().unwrap();
        assert_eq!(snap.now, t + chrono::Duration::minutes(1));
        assert_eq!(snap.candles.len(), 6);
    }

    #[tokio::test]
    async fn spread_straddles_close() {
        let mut f = feed(2, 10).with_spread(0.5);
        let snap = f.next_snapshot().await.unwrap().unwrap();
        assert!((snap.quote.spread() - 0.5).abs() < 1e-12);
        assert!(snap.htf_candles.is_some());
    }
}
