use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::exchange::MarketFeed;
use crate::models::{Candle, CandleSeries, Quote, Timeframe};
use crate::signals::MarketData;

/// Read a JSON array of candles, sorted oldest-first with duplicate
/// timestamps removed.
pub fn load_candles(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut candles: Vec<Candle> =
        serde_json::from_str(&content).with_context(|| format!("parsing candles in {}", path.display()))?;
    candles.sort_by_key(|c| c.timestamp);
    candles.dedup_by_key(|c| c.timestamp);
    Ok(candles)
}

/// Pulls bars from a JSON file kept current by an external collector.
/// `next_snapshot` yields `None` until a bar newer than the last one seen
/// appears; a missing or half-written file counts as no new data.
pub struct FileFeed {
    path: PathBuf,
    symbol: String,
    timeframe: Timeframe,
    lookback: usize,
    half_spread: f64,
    last_bar: Option<DateTime<Utc>>,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>, symbol: &str, timeframe: Timeframe, lookback: usize) -> Self {
        Self {
            path: path.into(),
            symbol: symbol.to_string(),
            timeframe,
            lookback,
            half_spread: 0.0,
            last_bar: None,
        }
    }

    pub fn with_spread(mut self, spread: f64) -> Self {
        self.half_spread = spread.max(0.0) / 2.0;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_bar(&self) -> Option<DateTime<Utc>> {
        self.last_bar
    }
}

#[async_trait]
impl MarketFeed for FileFeed {
    async fn next_snapshot(&mut self) -> Result<Option<MarketData>> {
        let candles = match load_candles(&self.path) {
            Ok(c) => c,
            Err(e) => {
                debug!("Feed {} unavailable: {:#}", self.path.display(), e);
                return Ok(None);
            }
        };
        let Some(last) = candles.last() else {
            return Ok(None);
        };
        if self.last_bar.is_some_and(|t| t >= last.timestamp) {
            return Ok(None);
        }
        let (close, bar_time) = (last.close, last.timestamp);
        self.last_bar = Some(bar_time);

        let start = candles.len().saturating_sub(self.lookback);
        let series = CandleSeries::new(candles[start..].to_vec());
        let htf_candles = self.timeframe.higher().map(|tf| series.resample(tf.as_duration()));
        let now = Utc::now().max(bar_time);

        Ok(Some(MarketData {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            candles: series,
            htf_candles,
            quote: Quote::new(close - self.half_spread, close + self.half_spread, now),
            now,
        }))
    }
}
