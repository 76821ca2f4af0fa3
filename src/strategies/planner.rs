use tracing::debug;

use crate::config::{Config, DecisionConfig, InstrumentSpec, TradingProfile};
use crate::core::stop_loss::StopLossEngine;
use crate::error::ExecutionError;
use crate::filters::{ConfluenceReport, MarketSnapshot};
use crate::models::{Direction, OrderSpec, OrderStyle, TakeProfitLevel};
use crate::signals::PatternSignal;

/// Account figures needed to size one order.
#[derive(Debug, Clone, Copy)]
pub struct SizingContext {
    pub balance: f64,
    pub risk_scale: f64,
    /// Lots already live on this symbol.
    pub symbol_exposure: f64,
}

/// Turns an ENTER decision into a concrete [`OrderSpec`]: entry, structural
/// stop, R-multiple ladder and volume.
pub struct OrderPlanner {
    decision: DecisionConfig,
    instrument: InstrumentSpec,
    close_pcts: [f64; 3],
    stops: StopLossEngine,
}

impl OrderPlanner {
    pub fn new(cfg: &Config) -> Self {
        Self {
            decision: cfg.decision.clone(),
            instrument: cfg.instrument.clone(),
            close_pcts: cfg.lifecycle.tp_close_pcts,
            stops: StopLossEngine::new(
                cfg.decision.swing_lookback,
                cfg.decision.stop_buffer_pips * cfg.instrument.pip_size,
            ),
        }
    }

    pub fn stop_engine(&self) -> &StopLossEngine {
        &self.stops
    }

    pub fn plan(
        &self,
        pattern: &PatternSignal,
        snap: &MarketSnapshot,
        report: &ConfluenceReport,
        profile: &TradingProfile,
        sizing: SizingContext,
    ) -> Result<OrderSpec, ExecutionError> {
        let dir = pattern.direction;
        let atr = snap.atr;

        // Step 1: entry price per style
        let market = snap.data.quote.entry_side(dir);
        let offset = self.decision.pending_offset_atr * atr;
        let style = self.decision.entry_style;
        let entry = match style {
            OrderStyle::Market => market,
            OrderStyle::PendingStop => market + dir.sign() * offset,
            OrderStyle::PendingLimit => market - dir.sign() * offset,
        };

        // Step 2: stop beyond the invalidating level
        let zone_edge = snap.zones.supporting(dir).map(|z| match dir {
            Direction::Long => z.low,
            Direction::Short => z.high,
        });
        let stop = self.stops.initial_stop(
            entry,
            dir,
            &snap.data.candles,
            zone_edge,
            atr,
            self.decision.stop_atr_mult,
        );
        let risk = (entry - stop.price).abs();
        if risk <= 0.0 || !dir.is_better(entry, stop.price) {
            return Err(ExecutionError::InvalidStops(format!(
                "stop {:.5} not on the losing side of entry {:.5}",
                stop.price, entry
            )));
        }

        // Step 3: R-multiple ladder, last rung stretched to opposing structure
        let mut take_profits = [0, 1, 2].map(|i| TakeProfitLevel {
            price: entry + dir.sign() * risk * profile.tp_r_multiples[i],
            close_pct: self.close_pcts[i],
            r_multiple: profile.tp_r_multiples[i],
        });
        if self.decision.structural_targets {
            let near_edge = snap.zones.opposing(dir).map(|z| match dir {
                Direction::Long => z.low,
                Direction::Short => z.high,
            });
            if let Some(edge) = near_edge {
                if dir.is_better(edge, take_profits[2].price) {
                    take_profits[2].price = edge;
                    take_profits[2].r_multiple = round2((edge - entry).abs() / risk);
                }
            }
        }

        // Step 4: size
        let factor = if self.decision.confluence_sizing {
            confluence_factor(report.ratio(), self.decision.min_confluence_scale)
        } else {
            1.0
        };
        let volume = self.position_size(
            sizing.balance,
            profile.risk_per_trade_pct,
            sizing.risk_scale * factor,
            risk,
            sizing.symbol_exposure,
        )?;

        let expiry = match style {
            OrderStyle::Market => None,
            _ => Some(snap.now() + profile.pending_expiry()),
        };

        let spec = OrderSpec {
            direction: dir,
            style,
            entry_price: entry,
            stop_loss: stop.price,
            take_profits,
            volume,
            expiry,
            pattern: pattern.name.clone(),
            stop_mode: stop.mode,
            reason: format!(
                "{} {} | {}/{} filters | {}",
                pattern.name, dir, report.score, report.active, stop.reason
            ),
        };
        if !spec.is_well_formed() {
            return Err(ExecutionError::InvalidStops(format!(
                "order ladder out of order: entry {:.5} stop {:.5} targets {:?}",
                spec.entry_price,
                spec.stop_loss,
                spec.take_profits.map(|t| t.price)
            )));
        }

        debug!(
            "Planned {} {} {} @ {:.5} SL {:.5} ({}) vol {:.2}",
            spec.style, spec.direction, spec.pattern, spec.entry_price, spec.stop_loss, spec.stop_mode, spec.volume
        );
        Ok(spec)
    }

    /// Lots risking `risk_pct` of `balance` (times `scale`) over `stop_distance`,
    /// floored to the lot step and clamped to the per-trade and per-symbol caps.
    pub fn position_size(
        &self,
        balance: f64,
        risk_pct: f64,
        scale: f64,
        stop_distance: f64,
        symbol_exposure: f64,
    ) -> Result<f64, ExecutionError> {
        let inst = &self.instrument;
        if stop_distance <= 0.0 || inst.contract_size <= 0.0 {
            return Err(ExecutionError::InvalidStops("zero stop distance".to_string()));
        }
        let risk_amount = balance * risk_pct / 100.0 * scale;
        let raw = risk_amount / (stop_distance * inst.contract_size);

        let room = (inst.max_lots_per_symbol - symbol_exposure).max(0.0);
        let capped = raw.min(inst.max_lot_per_trade).min(room);
        let volume = floor_to_step(capped, inst.lot_step);

        if volume + 1e-9 < inst.min_lot {
            debug!(
                "Size {:.4} lots (raw {:.4}) below minimum {:.2}",
                volume, raw, inst.min_lot
            );
            return Err(ExecutionError::InvalidVolume(volume));
        }
        Ok(volume)
    }
}

/// Linear map of the pass ratio into `[min_scale, 1]`.
pub fn confluence_factor(ratio: f64, min_scale: f64) -> f64 {
    let min_scale = min_scale.clamp(0.0, 1.0);
    (min_scale + (1.0 - min_scale) * ratio.clamp(0.0, 1.0)).clamp(min_scale, 1.0)
}

fn floor_to_step(volume: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return volume;
    }
    let steps = (volume / step + 1e-9).floor();
    round8(steps * step)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round8(x: f64) -> f64 {
    (x * 1e8).round() / 1e8
}
