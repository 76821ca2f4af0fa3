pub mod file_feed;
pub mod historical;
pub mod paper;

pub use file_feed::{load_candles, FileFeed};
pub use historical::HistoricalFeed;
pub use paper::PaperGateway;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::models::OrderSpec;
use crate::signals::MarketData;

/// Accepted order. `filled_price` is set when it filled on placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: u64,
    pub filled_price: Option<f64>,
}

/// Something the execution boundary did on its own since the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
    Filled { id: u64, price: f64, time: DateTime<Utc> },
    Closed { id: u64, price: f64, time: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub equity: f64,
    pub used_margin: f64,
    pub free_margin: f64,
}

/// Broker side of the engine. Order ids it hands out are the position ids
/// the lifecycle manager tracks.
#[async_trait]
pub trait ExecutionGateway: Send {
    async fn place_order(&mut self, spec: &OrderSpec) -> Result<Placement, ExecutionError>;

    async fn modify_stop(&mut self, id: u64, stop: f64) -> Result<(), ExecutionError>;

    /// Close `volume` lots of a filled position. Returns the fill price.
    async fn close_volume(&mut self, id: u64, volume: f64, price: f64) -> Result<f64, ExecutionError>;

    async fn cancel_order(&mut self, id: u64) -> Result<(), ExecutionError>;

    async fn poll_events(&mut self) -> Vec<ExecutionEvent>;

    /// Ids of filled positions the boundary still holds.
    async fn open_positions(&mut self) -> Result<Vec<u64>, ExecutionError>;

    async fn account(&mut self) -> Result<AccountInfo, ExecutionError>;
}

/// Snapshot pull of market data, one call per pass.
#[async_trait]
pub trait MarketFeed: Send {
    /// `Ok(None)` when the feed is exhausted (end of a replay).
    async fn next_snapshot(&mut self) -> Result<Option<MarketData>>;
}
