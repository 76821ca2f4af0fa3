use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ReEntryConfig;
use crate::models::{CloseReason, Direction};
use crate::trading::stats::ClosedTrade;

/// A stopped-out setup kept alive for another attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReEntryTicket {
    pub pattern: String,
    pub direction: Direction,
    pub stopped_out_at: DateTime<Utc>,
    pub attempts_used: u32,
    pub entry_price: f64,
    pub stop_price: f64,
    /// Set once the cooldown has passed; only armed tickets can be consumed.
    pub armed: bool,
    pub bars_waited: u32,
}

impl ReEntryTicket {
    pub fn matches(&self, pattern: &str, direction: Direction) -> bool {
        self.pattern == pattern && self.direction == direction
    }

    /// Price has closed far enough past the old stop that the setup is gone.
    fn invalidated(&self, close: f64, atr: f64, invalidation_atr: f64) -> bool {
        let beyond = (self.stop_price - close) * self.direction.sign();
        beyond > atr * invalidation_atr
    }
}

pub struct ReEntryBook {
    cfg: ReEntryConfig,
    tickets: Vec<ReEntryTicket>,
}

impl ReEntryBook {
    pub fn new(cfg: ReEntryConfig) -> Self {
        Self {
            cfg,
            tickets: Vec::new(),
        }
    }

    pub fn tickets(&self) -> &[ReEntryTicket] {
        &self.tickets
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Offer a closed trade. Only losses whose setup still stands, with
    /// attempts left, become tickets.
    pub fn on_close(&mut self, trade: &ClosedTrade, last_close: f64, atr: f64) -> Option<&ReEntryTicket> {
        if !self.cfg.enabled || trade.reason != CloseReason::Loss {
            return None;
        }
        if trade.reentry_attempt >= self.cfg.max_attempts {
            info!(
                "{} {} exhausted {} re-entry attempts; needs a fresh detection",
                trade.pattern, trade.direction, self.cfg.max_attempts
            );
            return None;
        }
        let ticket = ReEntryTicket {
            pattern: trade.pattern.clone(),
            direction: trade.direction,
            stopped_out_at: trade.closed_at,
            attempts_used: trade.reentry_attempt,
            entry_price: trade.entry_price,
            stop_price: trade.stop_loss,
            armed: self.cfg.cooldown_bars == 0,
            bars_waited: 0,
        };
        if ticket.invalidated(last_close, atr, self.cfg.invalidation_atr) {
            debug!("{} stop-out already invalidated the setup", trade.pattern);
            return None;
        }

        // One ticket per setup; a newer stop-out replaces the old one.
        self.tickets.retain(|t| !t.matches(&ticket.pattern, ticket.direction));
        if self.tickets.len() >= self.cfg.max_tickets {
            let oldest = self
                .tickets
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| t.stopped_out_at)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                let dropped = self.tickets.remove(i);
                debug!("Ticket book full, dropped {} {}", dropped.pattern, dropped.direction);
            }
        }
        info!(
            "Re-entry ticket armed for {} {} (attempt {} of {})",
            ticket.pattern,
            ticket.direction,
            ticket.attempts_used + 1,
            self.cfg.max_attempts
        );
        self.tickets.push(ticket);
        self.tickets.last()
    }

    /// Once per bar: count cooldown, drop expired and invalidated tickets.
    pub fn on_bar(&mut self, now: DateTime<Utc>, last_close: f64, atr: f64, validity: Duration) {
        let cooldown = self.cfg.cooldown_bars;
        let invalidation_atr = self.cfg.invalidation_atr;
        self.tickets.retain_mut(|t| {
            if now - t.stopped_out_at > validity {
                debug!("Re-entry ticket {} {} expired", t.pattern, t.direction);
                return false;
            }
            if t.invalidated(last_close, atr, invalidation_atr) {
                debug!("Re-entry ticket {} {} invalidated", t.pattern, t.direction);
                return false;
            }
            t.bars_waited += 1;
            if t.bars_waited >= cooldown {
                t.armed = true;
            }
            true
        });
    }

    pub fn find(&self, pattern: &str, direction: Direction) -> Option<&ReEntryTicket> {
        self.tickets
            .iter()
            .find(|t| t.armed && t.matches(pattern, direction))
    }

    /// Remove and return the armed ticket for this setup, if any. The new
    /// position should carry `attempts_used + 1`.
    pub fn consume(&mut self, pattern: &str, direction: Direction) -> Option<ReEntryTicket> {
        let idx = self
            .tickets
            .iter()
            .position(|t| t.armed && t.matches(pattern, direction))?;
        Some(self.tickets.remove(idx))
    }

    pub fn clear(&mut self) {
        self.tickets.clear();
    }
}
