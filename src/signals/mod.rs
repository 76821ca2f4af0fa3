//! Typed outputs of the external signal collaborators and the timeout-bounded
//! request/response seam they are polled through.

pub mod builtin;
pub mod ml;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::SignalError;
use crate::models::{CandleSeries, Decision, Direction, Quote, Timeframe, Trend};

pub use builtin::{structure_signals, StructurePatternDetector, SwingZoneDetector};
pub use ml::FileMlProvider;

/// Raw market pull for one pass: the entry-timeframe bars plus the live quote.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: CandleSeries,
    pub htf_candles: Option<CandleSeries>,
    pub quote: Quote,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSignal {
    pub name: String,
    pub strength: f64,
    pub direction: Direction,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceZone {
    pub low: f64,
    pub high: f64,
}

impl PriceZone {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.low && price <= self.high
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneSignal {
    pub demand: Option<PriceZone>,
    pub supply: Option<PriceZone>,
    pub inside_zone: bool,
}

impl ZoneSignal {
    /// Zone that supports a trade on `direction` (demand for longs).
    pub fn supporting(&self, direction: Direction) -> Option<PriceZone> {
        match direction {
            Direction::Long => self.demand,
            Direction::Short => self.supply,
        }
    }

    pub fn opposing(&self, direction: Direction) -> Option<PriceZone> {
        self.supporting(direction.opposite())
    }

    pub fn inside_opposing(&self, direction: Direction, price: f64) -> bool {
        self.inside_zone && self.opposing(direction).is_some_and(|z| z.contains(price))
    }
}

/// Booleans from the structure detectors, each expressed as the direction it
/// favors (or `None`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StructureSignals {
    pub liquidity_sweep: Option<Direction>,
    pub retail_trap: Option<Direction>,
    pub break_of_structure: Option<Direction>,
    pub divergence: Option<Direction>,
    pub trend: Trend,
    pub htf_trend: Trend,
}

impl Default for StructureSignals {
    fn default() -> Self {
        Self {
            liquidity_sweep: None,
            retail_trap: None,
            break_of_structure: None,
            divergence: None,
            trend: Trend::Neutral,
            htf_trend: Trend::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MlSignal {
    pub signal: Decision,
    pub probability: f64,
    pub confidence: f64,
}

impl MlSignal {
    /// Documented answer when the model does not respond in time.
    pub fn neutral() -> Self {
        Self {
            signal: Decision::Wait,
            probability: 0.5,
            confidence: 0.0,
        }
    }

    pub fn clamped(self) -> Self {
        Self {
            signal: self.signal,
            probability: self.probability.clamp(0.0, 1.0),
            confidence: self.confidence.clamp(0.0, 1.0),
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.confidence == 0.0
    }
}

/// Result of polling a collaborator. Timeouts and outages are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome<T> {
    Ready(T),
    TimedOut,
    Unavailable(String),
}

impl<T> SignalOutcome<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            SignalOutcome::Ready(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, SignalOutcome::Ready(_))
    }
}

#[async_trait]
pub trait SignalProvider: Send {
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn request(&mut self, data: &MarketData) -> Result<Self::Output, SignalError>;
}

/// Ask `provider` for a value, giving up after `timeout`.
pub async fn poll<P>(provider: &mut P, data: &MarketData, timeout: Duration) -> SignalOutcome<P::Output>
where
    P: SignalProvider + ?Sized,
{
    let name = provider.name();
    match tokio::time::timeout(timeout, provider.request(data)).await {
        Ok(Ok(value)) => SignalOutcome::Ready(value),
        Ok(Err(SignalError::Timeout)) | Err(_) => {
            debug!("Signal provider {} timed out after {:?}", name, timeout);
            SignalOutcome::TimedOut
        }
        Ok(Err(e)) => {
            debug!("Signal provider {} unavailable: {}", name, e);
            SignalOutcome::Unavailable(e.to_string())
        }
    }
}
