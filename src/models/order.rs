use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Direction, OrderStyle, StopMode};

/// Live top-of-book for the traded instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl Quote {
    pub fn new(bid: f64, ask: f64, time: DateTime<Utc>) -> Self {
        Self { bid, ask, time }
    }

    /// A zero-spread quote, convenient for replaying bar closes.
    pub fn at(price: f64, time: DateTime<Utc>) -> Self {
        Self::new(price, price, time)
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// Price at which a new position on `direction` would fill at market.
    pub fn entry_side(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.ask,
            Direction::Short => self.bid,
        }
    }

    /// Price at which an existing position on `direction` is marked and closed.
    pub fn exit_side(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.bid,
            Direction::Short => self.ask,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub price: f64,
    /// Share of the original volume closed when this level is touched (0..=100).
    pub close_pct: f64,
    pub r_multiple: f64,
}

/// Everything needed to place one entry order. Produced once per ENTER
/// decision and consumed immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    pub direction: Direction,
    pub style: OrderStyle,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: [TakeProfitLevel; 3],
    pub volume: f64,
    pub expiry: Option<DateTime<Utc>>,
    pub pattern: String,
    pub stop_mode: StopMode,
    pub reason: String,
}

impl OrderSpec {
    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }

    pub fn close_pct_total(&self) -> f64 {
        self.take_profits.iter().map(|tp| tp.close_pct).sum()
    }

    /// True when the stop sits on the losing side of the entry and every
    /// target sits on the winning side, in ascending distance.
    pub fn is_well_formed(&self) -> bool {
        let d = self.direction;
        if !d.is_better(self.entry_price, self.stop_loss) {
            return false;
        }
        let mut prev = self.entry_price;
        for tp in &self.take_profits {
            if !d.is_better(tp.price, prev) {
                return false;
            }
            prev = tp.price;
        }
        self.volume > 0.0 && self.close_pct_total() <= 100.0 + 1e-9
    }
}
