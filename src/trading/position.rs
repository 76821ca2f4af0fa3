use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CloseReason, Direction, OrderSpec, OrderStyle, PositionState};

/// Price comparisons tolerate float noise from R-multiple arithmetic.
pub const PRICE_EPSILON: f64 = 1e-9;
/// Volume below this is treated as fully closed.
pub const VOLUME_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub price: f64,
    pub close_pct: f64,
    pub r_multiple: f64,
    pub hit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub direction: Direction,
    pub style: OrderStyle,
    pub entry_price: f64,
    pub stop_loss: f64,
    /// Entry-to-stop distance at fill; the unit for every R-multiple.
    pub initial_risk: f64,
    pub take_profits: [TakeProfitTarget; 3],
    pub break_even_moved: bool,
    pub trailing_active: bool,
    pub original_volume: f64,
    pub remaining_volume: f64,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
    pub pattern: String,
    /// Id of the root position this one pyramids onto (its own id for roots).
    pub pyramid_group: u64,
    pub pyramid_level: u32,
    pub reentry_attempt: u32,
    /// Most favorable exit-side price seen since the fill.
    pub high_water: f64,
    pub state: PositionState,
    pub realized_pnl: f64,
    pub frozen: bool,
}

impl Position {
    pub fn from_spec(id: u64, spec: &OrderSpec, now: DateTime<Utc>) -> Self {
        let take_profits = spec.take_profits.map(|tp| TakeProfitTarget {
            price: tp.price,
            close_pct: tp.close_pct,
            r_multiple: tp.r_multiple,
            hit: false,
        });
        Self {
            id,
            direction: spec.direction,
            style: spec.style,
            entry_price: spec.entry_price,
            stop_loss: spec.stop_loss,
            initial_risk: spec.stop_distance(),
            take_profits,
            break_even_moved: false,
            trailing_active: false,
            original_volume: spec.volume,
            remaining_volume: spec.volume,
            created_at: now,
            opened_at: None,
            expiry: spec.expiry,
            pattern: spec.pattern.clone(),
            pyramid_group: id,
            pyramid_level: 0,
            reentry_attempt: 0,
            high_water: spec.entry_price,
            state: PositionState::Pending,
            realized_pnl: 0.0,
            frozen: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.pyramid_group == self.id
    }

    /// Favorable move from entry to `price`, in multiples of the initial risk.
    pub fn r_multiple(&self, price: f64) -> f64 {
        if self.initial_risk <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) * self.direction.sign() / self.initial_risk
    }

    pub fn floating_pnl(&self, price: f64, contract_size: f64) -> f64 {
        if !self.state.is_live() {
            return 0.0;
        }
        pnl(self.direction, self.entry_price, price, self.remaining_volume, contract_size)
    }

    /// Stop at entry or better: a touch can no longer lose money.
    pub fn stop_protects_entry(&self) -> bool {
        (self.stop_loss - self.entry_price) * self.direction.sign() >= -PRICE_EPSILON
    }

    pub fn stop_touched(&self, price: f64) -> bool {
        (self.stop_loss - price) * self.direction.sign() >= -PRICE_EPSILON
    }

    pub fn reached(&self, price: f64, level: f64) -> bool {
        (price - level) * self.direction.sign() >= -PRICE_EPSILON
    }

    pub fn close_reason_for_stop(&self) -> CloseReason {
        if self.break_even_moved || self.stop_protects_entry() {
            CloseReason::Breakeven
        } else {
            CloseReason::Loss
        }
    }

    /// Structural consistency between the state tag and the bookkeeping
    /// fields. A failure means a bug upstream, never a market outcome.
    pub fn check_invariants(&self) -> Result<(), String> {
        let hits = self.take_profits.map(|t| t.hit);
        let pct_total: f64 = self.take_profits.iter().map(|t| t.close_pct).sum();
        if pct_total > 100.0 + 1e-6 {
            return Err(format!("take-profit close percentages sum to {:.2}", pct_total));
        }
        if self.remaining_volume < -VOLUME_EPSILON
            || self.remaining_volume > self.original_volume + VOLUME_EPSILON
        {
            return Err(format!(
                "remaining volume {} outside 0..={}",
                self.remaining_volume, self.original_volume
            ));
        }
        match self.state {
            PositionState::Pending if hits.iter().any(|h| *h) || self.opened_at.is_some() => {
                Err("pending position with fills or take-profit hits".to_string())
            }
            PositionState::Open if hits.iter().any(|h| *h) => {
                Err("open position with a take-profit already hit".to_string())
            }
            PositionState::Partial1 if !hits[0] || hits[1] || hits[2] => {
                Err(format!("partial_1 with hit flags {:?}", hits))
            }
            PositionState::Partial2 if !hits[0] || !hits[1] || hits[2] => {
                Err(format!("partial_2 with hit flags {:?}", hits))
            }
            s if s.is_live() && self.remaining_volume <= VOLUME_EPSILON => {
                Err(format!("{} position with no remaining volume", s))
            }
            s if s.is_live() && self.opened_at.is_none() => Err(format!("{} position never filled", s)),
            _ => Ok(()),
        }
    }
}

pub fn pnl(direction: Direction, entry: f64, exit: f64, volume: f64, contract_size: f64) -> f64 {
    (exit - entry) * direction.sign() * volume * contract_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::long_spec;

    #[test]
    fn r_multiples_from_initial_risk() {
        let p = Position::from_spec(1, &long_spec(1.1000, 1.0950, 1.0), Utc::now());
        assert!((p.r_multiple(1.1050) - 1.0).abs() < 1e-6);
        assert!((p.r_multiple(1.0925) + 0.5).abs() < 1e-6);
        assert!(p.is_root());
    }

    #[test]
    fn stop_classification() {
        let mut p = Position::from_spec(1, &long_spec(1.1000, 1.0950, 1.0), Utc::now());
        assert_eq!(p.close_reason_for_stop(), CloseReason::Loss);
        p.stop_loss = 1.1000;
        assert_eq!(p.close_reason_for_stop(), CloseReason::Breakeven);
        assert!(p.stop_touched(1.1000));
        assert!(!p.stop_touched(1.1001));
    }

    #[test]
    fn invariants_flag_inconsistent_state() {
        let mut p = Position::from_spec(1, &long_spec(1.1000, 1.0950, 1.0), Utc::now());
        assert!(p.check_invariants().is_ok());
        p.state = PositionState::Partial2;
        p.opened_at = Some(Utc::now());
        p.take_profits[0].hit = true;
        assert!(p.check_invariants().is_err());
        p.take_profits[1].hit = true;
        assert!(p.check_invariants().is_ok());
        p.remaining_volume = 0.0;
        assert!(p.check_invariants().is_err());
    }

    #[test]
    fn pnl_in_account_currency() {
        let v = pnl(Direction::Short, 1.1000, 1.0950, 1.0, 100_000.0);
        assert!((v - 500.0).abs() < 1e-6);
    }
}
