use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::config::{InstrumentSpec, LifecycleConfig, TradingProfile};
use crate::core::stop_loss::StopLossEngine;
use crate::error::LifecycleError;
use crate::models::{CandleSeries, CloseReason, Direction, OrderSpec, OrderStyle, PositionState, Quote, StopMode, TakeProfitLevel};
use crate::trading::position::{pnl, Position, VOLUME_EPSILON};
use crate::trading::stats::ClosedTrade;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAdjustment {
    BreakEven,
    Trailing,
}

/// Instruction for the execution boundary produced while advancing positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LifecycleAction {
    ModifyStop {
        id: u64,
        stop: f64,
        kind: StopAdjustment,
    },
    ClosePartial {
        id: u64,
        volume: f64,
        price: f64,
        level: usize,
    },
    Close {
        id: u64,
        volume: f64,
        price: f64,
        reason: CloseReason,
    },
    CancelPending {
        id: u64,
    },
    OpenPyramid {
        root_id: u64,
        level: u32,
        spec: OrderSpec,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleAnomaly {
    pub id: u64,
    pub state: PositionState,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub actions: Vec<LifecycleAction>,
    pub closed: Vec<ClosedTrade>,
    pub expired: Vec<u64>,
    pub anomalies: Vec<LifecycleAnomaly>,
}

/// Market context for one advance step.
pub struct TickContext<'a> {
    pub quote: Quote,
    pub candles: &'a CandleSeries,
    pub atr: f64,
    pub now: DateTime<Utc>,
}

/// Owns every pending and live position and walks each through
/// PENDING -> OPEN -> PARTIAL_1 -> PARTIAL_2 -> CLOSED.
pub struct LifecycleManager {
    cfg: LifecycleConfig,
    instrument: InstrumentSpec,
    stop_engine: StopLossEngine,
    positions: Vec<Position>,
    /// Current pyramid level per root position id, reserved at emission.
    pyramid_levels: HashMap<u64, u32>,
}

impl LifecycleManager {
    pub fn new(cfg: LifecycleConfig, instrument: InstrumentSpec, stop_engine: StopLossEngine) -> Self {
        Self {
            cfg,
            instrument,
            stop_engine,
            positions: Vec::new(),
            pyramid_levels: HashMap::new(),
        }
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn get(&self, id: u64) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cfg.max_positions
    }

    pub fn live_volume(&self) -> f64 {
        self.positions
            .iter()
            .filter(|p| p.state.is_live() || p.state == PositionState::Pending)
            .map(|p| p.remaining_volume)
            .sum()
    }

    pub fn same_side_count(&self, direction: Direction) -> usize {
        self.positions
            .iter()
            .filter(|p| p.direction == direction && !p.state.is_closed())
            .count()
    }

    pub fn floating_pnl(&self, quote: &Quote) -> f64 {
        self.positions
            .iter()
            .map(|p| p.floating_pnl(quote.exit_side(p.direction), self.instrument.contract_size))
            .sum()
    }

    pub fn pyramid_level(&self, root_id: u64) -> u32 {
        self.pyramid_levels.get(&root_id).copied().unwrap_or(0)
    }

    fn check_capacity(&self, id: u64) -> Result<(), LifecycleError> {
        if self.positions.iter().any(|p| p.id == id) {
            return Err(LifecycleError::DuplicateId(id));
        }
        if self.positions.len() >= self.cfg.max_positions {
            return Err(LifecycleError::CapacityExceeded(self.cfg.max_positions));
        }
        Ok(())
    }

    pub fn has_room(&self) -> bool {
        self.positions.len() < self.cfg.max_positions
    }

    /// Track a freshly placed entry order.
    pub fn register_pending(
        &mut self,
        id: u64,
        spec: &OrderSpec,
        reentry_attempt: u32,
        now: DateTime<Utc>,
    ) -> Result<&Position, LifecycleError> {
        self.check_capacity(id)?;
        let mut pos = Position::from_spec(id, spec, now);
        pos.reentry_attempt = reentry_attempt;
        info!(
            "Registered {} {} #{} entry={:.5} sl={:.5} vol={:.2} ({})",
            pos.style, pos.direction, id, pos.entry_price, pos.stop_loss, pos.original_volume, pos.pattern
        );
        self.positions.push(pos);
        Ok(&self.positions[self.positions.len() - 1])
    }

    /// Track an add-on order for `root_id` at the level reserved when it was emitted.
    pub fn register_pyramid(
        &mut self,
        id: u64,
        root_id: u64,
        level: u32,
        spec: &OrderSpec,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        self.check_capacity(id)?;
        let mut pos = Position::from_spec(id, spec, now);
        pos.pyramid_group = root_id;
        pos.pyramid_level = level;
        info!("Pyramid level {} on #{} registered as #{}", level, root_id, id);
        self.positions.push(pos);
        Ok(())
    }

    /// Give back a reserved pyramid level whose order never made it.
    pub fn release_pyramid(&mut self, root_id: u64) {
        if let Some(level) = self.pyramid_levels.get_mut(&root_id) {
            *level = level.saturating_sub(1);
        }
    }

    /// PENDING -> OPEN. Unknown ids are somebody else's orders: logged and ignored.
    pub fn on_fill(&mut self, id: u64, price: f64, at: DateTime<Utc>) -> bool {
        let Some(pos) = self.positions.iter_mut().find(|p| p.id == id) else {
            warn!("Fill for untracked order #{} @ {:.5} ignored", id, price);
            return false;
        };
        if pos.state != PositionState::Pending {
            warn!("Duplicate fill for #{} in state {} ignored", id, pos.state);
            return false;
        }
        pos.entry_price = price;
        pos.initial_risk = (price - pos.stop_loss).abs();
        pos.high_water = price;
        pos.opened_at = Some(at);
        pos.state = PositionState::Open;
        info!("#{} filled @ {:.5}", id, price);
        true
    }

    /// The execution boundary closed a position on its own (broker stop,
    /// margin call, manual intervention elsewhere).
    pub fn on_external_close(&mut self, id: u64, price: f64, at: DateTime<Utc>) -> Option<ClosedTrade> {
        let Some(idx) = self.positions.iter().position(|p| p.id == id) else {
            warn!("Close for untracked position #{} ignored", id);
            return None;
        };
        Some(self.finish(idx, price, CloseReason::External, at))
    }

    /// Close on operator request. Pending orders are simply dropped.
    pub fn close_manual(&mut self, id: u64, price: f64, at: DateTime<Utc>) -> Result<Option<ClosedTrade>, LifecycleError> {
        let idx = self
            .positions
            .iter()
            .position(|p| p.id == id)
            .ok_or(LifecycleError::UnknownId(id))?;
        if self.positions[idx].state == PositionState::Pending {
            self.positions.remove(idx);
            return Ok(None);
        }
        Ok(Some(self.finish(idx, price, CloseReason::Manual, at)))
    }

    pub fn ids(&self) -> Vec<u64> {
        self.positions.iter().map(|p| p.id).collect()
    }

    /// Advance every tracked position by one tick.
    pub fn advance(&mut self, ctx: &TickContext<'_>, profile: &TradingProfile) -> TickOutcome {
        let mut out = TickOutcome::default();
        let mut idx = 0;

        while idx < self.positions.len() {
            if self.positions[idx].frozen {
                idx += 1;
                continue;
            }

            if self.positions[idx].state == PositionState::Pending {
                if self.positions[idx].expiry.is_some_and(|e| ctx.now >= e) {
                    let pos = self.positions.remove(idx);
                    info!("#{} expired unfilled", pos.id);
                    out.actions.push(LifecycleAction::CancelPending { id: pos.id });
                    out.expired.push(pos.id);
                    continue;
                }
                idx += 1;
                continue;
            }

            if self.step_live(idx, ctx, profile, &mut out) {
                // Fully closed; removed in place
                continue;
            }

            if let Err(detail) = self.positions[idx].check_invariants() {
                let pos = &mut self.positions[idx];
                pos.frozen = true;
                error!("Position #{} frozen: {}", pos.id, detail);
                out.anomalies.push(LifecycleAnomaly {
                    id: pos.id,
                    state: pos.state,
                    detail,
                });
            }
            idx += 1;
        }

        out
    }

    /// Returns true when the position closed and was removed.
    fn step_live(&mut self, idx: usize, ctx: &TickContext<'_>, profile: &TradingProfile, out: &mut TickOutcome) -> bool {
        let contract = self.instrument.contract_size;
        let pos = &mut self.positions[idx];
        let price = ctx.quote.exit_side(pos.direction);

        // Step 1: stop before targets
        if pos.stop_touched(price) {
            let reason = pos.close_reason_for_stop();
            let stop = pos.stop_loss;
            out.actions.push(LifecycleAction::Close {
                id: pos.id,
                volume: pos.remaining_volume,
                price: stop,
                reason,
            });
            let trade = self.finish(idx, stop, reason, ctx.now);
            out.closed.push(trade);
            return true;
        }

        // Step 2: take-profit ladder
        for level in 0..3 {
            let pos = &mut self.positions[idx];
            let tp = pos.take_profits[level];
            if tp.hit || !pos.reached(price, tp.price) {
                continue;
            }
            pos.take_profits[level].hit = true;

            let final_level = level == 2;
            let volume = if final_level {
                pos.remaining_volume
            } else {
                (pos.original_volume * tp.close_pct / 100.0).min(pos.remaining_volume)
            };

            if final_level || pos.remaining_volume - volume <= VOLUME_EPSILON {
                out.actions.push(LifecycleAction::Close {
                    id: pos.id,
                    volume: pos.remaining_volume,
                    price: tp.price,
                    reason: CloseReason::Win,
                });
                let trade = self.finish(idx, tp.price, CloseReason::Win, ctx.now);
                out.closed.push(trade);
                return true;
            }

            pos.realized_pnl += pnl(pos.direction, pos.entry_price, tp.price, volume, contract);
            pos.remaining_volume -= volume;
            pos.state = if level == 0 {
                PositionState::Partial1
            } else {
                PositionState::Partial2
            };
            info!(
                "#{} TP{} @ {:.5}: closed {:.2}, {:.2} remaining",
                pos.id,
                level + 1,
                tp.price,
                volume,
                pos.remaining_volume
            );
            out.actions.push(LifecycleAction::ClosePartial {
                id: pos.id,
                volume,
                price: tp.price,
                level: level + 1,
            });
        }

        let pos = &mut self.positions[idx];
        if pos.direction.is_better(price, pos.high_water) {
            pos.high_water = price;
        }
        let best_r = pos.r_multiple(pos.high_water);

        // Step 3: one-way break-even move
        if !pos.break_even_moved && best_r + 1e-6 >= profile.break_even_trigger_r {
            let target = pos.entry_price + pos.direction.sign() * self.cfg.break_even_lock_pips * self.instrument.pip_size;
            pos.break_even_moved = true;
            if pos.direction.is_better(target, pos.stop_loss) {
                pos.stop_loss = target;
                info!("#{} stop to break-even {:.5}", pos.id, target);
                out.actions.push(LifecycleAction::ModifyStop {
                    id: pos.id,
                    stop: target,
                    kind: StopAdjustment::BreakEven,
                });
            }
        }

        // Step 4: trailing, never regresses
        if best_r + 1e-6 >= profile.trailing_activation_r {
            pos.trailing_active = true;
        }
        if pos.trailing_active {
            if let Some(stop) = self.stop_engine.trailing_stop(
                pos.direction,
                pos.stop_loss,
                price,
                ctx.candles,
                ctx.atr,
                self.cfg.trailing_atr_mult,
                self.cfg.structural_trailing,
            ) {
                pos.stop_loss = stop;
                out.actions.push(LifecycleAction::ModifyStop {
                    id: pos.id,
                    stop,
                    kind: StopAdjustment::Trailing,
                });
            }
        }

        // Step 5: pyramid from the root only
        if self.cfg.pyramid_enabled && pos.is_root() {
            let root_id = pos.id;
            let level = self.pyramid_levels.get(&root_id).copied().unwrap_or(0);
            let floating_r = pos.r_multiple(price);
            if level < self.cfg.pyramid_max_level
                && floating_r + 1e-6 >= profile.pyramid_trigger_r * (level + 1) as f64
            {
                let spec = self.pyramid_spec(&self.positions[idx], &ctx.quote, profile);
                if let Some(spec) = spec {
                    self.pyramid_levels.insert(root_id, level + 1);
                    info!("#{} at {:.2}R: pyramid level {}", root_id, floating_r, level + 1);
                    out.actions.push(LifecycleAction::OpenPyramid {
                        root_id,
                        level: level + 1,
                        spec,
                    });
                }
            }
        }

        false
    }

    /// Market add-on at the current price, risking the root's initial stop
    /// distance. The volume here is a first estimate; the engine re-sizes the
    /// add against the account and lot caps before placing it.
    fn pyramid_spec(&self, root: &Position, quote: &Quote, profile: &TradingProfile) -> Option<OrderSpec> {
        let dir = root.direction;
        let entry = quote.entry_side(dir);
        let risk = root.initial_risk;
        if risk <= 0.0 {
            return None;
        }
        let step = self.instrument.lot_step.max(f64::EPSILON);
        let volume = ((root.original_volume * self.cfg.pyramid_volume_factor) / step + 1e-9).floor() * step;
        if volume < self.instrument.min_lot {
            return None;
        }
        let take_profits = [0, 1, 2].map(|i| TakeProfitLevel {
            price: entry + dir.sign() * risk * profile.tp_r_multiples[i],
            close_pct: self.cfg.tp_close_pcts[i],
            r_multiple: profile.tp_r_multiples[i],
        });
        Some(OrderSpec {
            direction: dir,
            style: OrderStyle::Market,
            entry_price: entry,
            stop_loss: entry - dir.sign() * risk,
            take_profits,
            volume,
            expiry: None,
            pattern: root.pattern.clone(),
            stop_mode: StopMode::Atr,
            reason: format!("pyramid on #{}", root.id),
        })
    }

    fn finish(&mut self, idx: usize, price: f64, reason: CloseReason, at: DateTime<Utc>) -> ClosedTrade {
        let mut pos = self.positions.remove(idx);
        pos.realized_pnl += pnl(
            pos.direction,
            pos.entry_price,
            price,
            pos.remaining_volume,
            self.instrument.contract_size,
        );
        pos.remaining_volume = 0.0;
        pos.state = PositionState::Closed(reason);
        if pos.is_root() {
            self.pyramid_levels.remove(&pos.id);
        }
        info!(
            "#{} closed {} @ {:.5} pnl={:.2} ({})",
            pos.id, reason, price, pos.realized_pnl, pos.pattern
        );
        ClosedTrade {
            id: pos.id,
            direction: pos.direction,
            pattern: pos.pattern,
            entry_price: pos.entry_price,
            exit_price: price,
            stop_loss: pos.stop_loss,
            volume: pos.original_volume,
            pnl: pos.realized_pnl,
            reason,
            opened_at: pos.opened_at,
            closed_at: at,
            pyramid_level: pos.pyramid_level,
            reentry_attempt: pos.reentry_attempt,
        }
    }

    #[cfg(test)]
    pub(crate) fn position_mut(&mut self, id: u64) -> Option<&mut Position> {
        self.positions.iter_mut().find(|p| p.id == id)
    }
}
