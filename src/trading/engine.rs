use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, ProfileSelector, TradingProfile};
use crate::dashboard::export::{ConfluenceSummary, FilterState, PositionSummary, RiskSummary};
use crate::dashboard::{CommandEnvelope, OperatorCommand, StateSnapshot, SCHEMA_VERSION};
use crate::error::{CommandError, ConfigError, ExecutionError};
use crate::exchange::{ExecutionEvent, ExecutionGateway};
use crate::filters::{ConfluenceReport, FilterId, FilterRegistry, MarketSnapshot};
use crate::models::{
    CandleSeries, Decision, Direction, MarketRegime, OrderSpec, OrderStyle, PositionState, Quote, TakeProfitLevel,
};
use crate::signals::builtin::structural_bias;
use crate::signals::{structure_signals, MarketData, MlSignal, PatternSignal, SignalOutcome, ZoneSignal};
use crate::strategies::{BlockReason, DecisionEngine, OrderPlanner, RegimeContext, SizingContext};
use crate::trading::lifecycle::{LifecycleAction, LifecycleAnomaly, LifecycleManager, TickContext};
use crate::trading::reentry::ReEntryBook;
use crate::trading::risk::{GateStatus, RiskGovernor};
use crate::trading::stats::{ClosedTrade, StrengthTuner, TradingStats};

const TUNER_STEP: f64 = 0.05;

/// What the collaborators answered for this pass.
#[derive(Debug, Clone)]
pub struct SignalBundle {
    pub pattern: SignalOutcome<Option<PatternSignal>>,
    pub zones: SignalOutcome<ZoneSignal>,
    /// `None` when the model is switched off.
    pub ml: Option<SignalOutcome<MlSignal>>,
    pub news: Vec<DateTime<Utc>>,
}

impl Default for SignalBundle {
    fn default() -> Self {
        Self {
            pattern: SignalOutcome::Ready(None),
            zones: SignalOutcome::Ready(ZoneSignal::default()),
            ml: None,
            news: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    Placed { id: u64, filled: bool, reentry_attempt: u32 },
    Rejected(String),
    AlreadyTraded,
    NoCapacity,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub time: DateTime<Utc>,
    pub decision: Decision,
    pub direction: Option<Direction>,
    pub blocked_by: Option<BlockReason>,
    pub gate: GateStatus,
    pub confluence: ConfluenceReport,
    pub entry: Option<EntryOutcome>,
    pub actions: Vec<LifecycleAction>,
    pub closed: Vec<ClosedTrade>,
    pub expired: Vec<u64>,
    pub anomalies: Vec<LifecycleAnomaly>,
    pub rejected_commands: Vec<String>,
    /// Some collaborator answer was missing and a prior or neutral value stood in.
    pub degraded: bool,
}

/// Per-pass scratch collected while the engine works.
#[derive(Default)]
struct PassLog {
    actions: Vec<LifecycleAction>,
    closed: Vec<ClosedTrade>,
    expired: Vec<u64>,
    anomalies: Vec<LifecycleAnomaly>,
    rejected_commands: Vec<String>,
}

/// Single owner of all trading state. One `run_pass` per bar; commands are
/// queued between passes and applied at the start of the next one.
pub struct TradingEngine {
    cfg: Config,
    profiles: ProfileSelector,
    registry: FilterRegistry,
    decision: DecisionEngine,
    planner: OrderPlanner,
    lifecycle: LifecycleManager,
    risk: RiskGovernor,
    reentry: ReEntryBook,
    tuner: StrengthTuner,
    history: Vec<ClosedTrade>,
    commands: VecDeque<CommandEnvelope>,
    traded_setups: HashSet<(String, Direction, DateTime<Utc>)>,

    last_pattern: Option<PatternSignal>,
    last_zones: ZoneSignal,
    last_ml: Option<MlSignal>,
    last_report: Option<ConfluenceReport>,
    last_regime: Option<MarketRegime>,
    last_bias: Option<Direction>,
    last_quote: Option<Quote>,
    last_degraded: bool,
}

impl TradingEngine {
    pub fn new(cfg: Config) -> Result<Self, ConfigError> {
        cfg.lifecycle.validate()?;
        let profiles = ProfileSelector::new(cfg.profile.clone())?;
        let planner = OrderPlanner::new(&cfg);
        let lifecycle = LifecycleManager::new(
            cfg.lifecycle.clone(),
            cfg.instrument.clone(),
            crate::core::stop_loss::StopLossEngine::new(
                cfg.decision.swing_lookback,
                cfg.decision.stop_buffer_pips * cfg.instrument.pip_size,
            ),
        );

        info!(
            "Engine ready: {} {} profile={} min_confluence={} risk={:.2}% filters={}/20",
            cfg.instrument.symbol,
            cfg.profile.timeframe,
            cfg.profile.name,
            cfg.profile.min_confluence,
            cfg.profile.risk_per_trade_pct,
            FilterId::ALL.len() - cfg.disabled_filters.len()
        );

        Ok(Self {
            registry: FilterRegistry::new(&cfg.disabled_filters),
            decision: DecisionEngine::new(&cfg.decision),
            risk: RiskGovernor::new(cfg.risk.clone(), cfg.initial_balance),
            reentry: ReEntryBook::new(cfg.reentry.clone()),
            tuner: StrengthTuner::new(
                cfg.filters.min_pattern_strength,
                TUNER_STEP,
                cfg.filters.min_pattern_samples,
            ),
            profiles,
            planner,
            lifecycle,
            history: Vec::new(),
            commands: VecDeque::new(),
            traded_setups: HashSet::new(),
            last_pattern: None,
            last_zones: ZoneSignal::default(),
            last_ml: None,
            last_report: None,
            last_regime: None,
            last_bias: None,
            last_quote: None,
            last_degraded: false,
            cfg,
        })
    }

    /// Swap in a registry with alternative detectors. Disabled filters from
    /// the config are applied to it.
    pub fn with_registry(mut self, mut registry: FilterRegistry) -> Self {
        for &id in &self.cfg.disabled_filters {
            registry.set_active(id, false);
        }
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn profile(&self) -> Arc<TradingProfile> {
        self.profiles.active()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn risk(&self) -> &RiskGovernor {
        &self.risk
    }

    pub fn reentry(&self) -> &ReEntryBook {
        &self.reentry
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn history(&self) -> &[ClosedTrade] {
        &self.history
    }

    pub fn stats(&self) -> TradingStats {
        TradingStats::from_trades(&self.history)
    }

    /// Queue an operator command for the start of the next pass.
    pub fn enqueue(&mut self, command: CommandEnvelope) {
        debug!("Queued command {}", command.command_id);
        self.commands.push_back(command);
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// One full evaluation for the bar in `data`.
    pub async fn run_pass<G>(&mut self, data: MarketData, signals: SignalBundle, gw: &mut G) -> Result<PassReport>
    where
        G: ExecutionGateway + ?Sized,
    {
        let now = data.now;
        let quote = data.quote;
        let atr = data.candles.atr(self.cfg.decision.atr_period);
        let last_close = data.candles.last().map_or(quote.mid(), |c| c.close);
        let mut log = PassLog::default();
        self.last_quote = Some(quote);

        // Step 1: operator commands queued since the last pass
        self.apply_commands(&data, atr, gw, &mut log).await;

        // Step 2: calendar rollover and ticket housekeeping
        if self.risk.rollover(now) {
            info!("New trading day {}", now.date_naive());
        }
        let profile = self.profiles.active();
        self.reentry.on_bar(now, last_close, atr, profile.pattern_validity());

        // Step 3: reconcile with the execution boundary
        self.reconcile(gw, &quote, now, last_close, atr, &mut log).await?;

        // Step 4: advance every tracked position and execute its actions
        let outcome = self.lifecycle.advance(
            &TickContext {
                quote,
                candles: &data.candles,
                atr,
                now,
            },
            &profile,
        );
        for action in outcome.actions {
            if self.execute(&action, gw, now).await {
                log.actions.push(action);
            }
        }
        for trade in outcome.closed {
            self.record_close(trade, last_close, atr, &mut log);
        }
        log.expired.extend(outcome.expired);
        log.anomalies.extend(outcome.anomalies);

        // Step 5: profit targets flatten everything
        let floating = self.lifecycle.floating_pnl(&quote);
        let symbol_pnl = self.risk.state().realized_today + floating;
        if let Some(reason) = self.risk.check_profit_targets(floating, symbol_pnl) {
            info!("{} reached, closing all positions", reason);
            for id in self.lifecycle.ids() {
                self.close_position(id, &quote, now, last_close, atr, gw, &mut log).await;
            }
        }

        // Step 6: gate, snapshot, filters, decision
        let gate = self.risk.gate();
        let (snap, degraded) = self.build_snapshot(data, signals, &profile);
        let report = self
            .registry
            .evaluate(&snap, &self.cfg.filters, &self.cfg.decision, &profile);
        let ctx = RegimeContext::from_snapshot(&snap, self.cfg.filters.news_blackout_minutes);
        let outcome = self.decision.decide(&report, gate, &ctx, snap.pattern.as_ref());

        debug!(
            "{} {} | {}/{} (need {}) | regime {} | gate {:?}{}",
            now.format("%Y-%m-%d %H:%M"),
            outcome.decision,
            report.score,
            report.active,
            report.required,
            snap.regime,
            gate,
            outcome.blocked_by.map(|b| format!(" | {}", b)).unwrap_or_default()
        );

        // Step 7: act on ENTER
        let entry = match (outcome.decision, snap.pattern.as_ref()) {
            (Decision::Enter, Some(pattern)) => Some(self.enter(pattern, &snap, &report, &profile, gw).await),
            _ => None,
        };

        self.last_regime = Some(snap.regime);
        self.last_bias = snap.direction().or_else(|| structural_bias(&snap.structure));
        self.last_report = Some(report.clone());
        self.last_degraded = degraded;
        self.prune_traded_setups(now, profile.pattern_validity());

        Ok(PassReport {
            time: now,
            decision: outcome.decision,
            direction: outcome.direction,
            blocked_by: outcome.blocked_by,
            gate,
            confluence: report,
            entry,
            actions: log.actions,
            closed: log.closed,
            expired: log.expired,
            anomalies: log.anomalies,
            rejected_commands: log.rejected_commands,
            degraded,
        })
    }

    fn build_snapshot(
        &mut self,
        data: MarketData,
        signals: SignalBundle,
        profile: &TradingProfile,
    ) -> (MarketSnapshot, bool) {
        let mut degraded = false;

        let pattern = match signals.pattern {
            SignalOutcome::Ready(p) => {
                self.last_pattern = p.clone();
                p
            }
            other => {
                debug!("Pattern signal {:?}, reusing prior", other);
                degraded = true;
                self.last_pattern.clone()
            }
        };
        let zones = match signals.zones {
            SignalOutcome::Ready(z) => {
                self.last_zones = z.clone();
                z
            }
            _ => {
                degraded = true;
                self.last_zones.clone()
            }
        };
        let ml = match signals.ml {
            None => None,
            Some(SignalOutcome::Ready(m)) => {
                let m = m.clamped();
                self.last_ml = Some(m);
                Some(m)
            }
            Some(_) => {
                // Fail open: the neutral answer makes the model filter abstain
                degraded = true;
                Some(MlSignal::neutral())
            }
        };

        let structure = structure_signals(&data, &self.cfg);
        let (stats, tuned, reentry_since) = match &pattern {
            Some(p) => {
                let by_pattern = TradingStats::from_trades(&self.history).by_pattern;
                (
                    by_pattern.get(&p.name).cloned(),
                    self.tuner.threshold(&p.name),
                    self.reentry.find(&p.name, p.direction).map(|t| t.stopped_out_at),
                )
            }
            None => (None, None, None),
        };
        let exposure = pattern
            .as_ref()
            .map_or(0, |p| self.lifecycle.same_side_count(p.direction));

        let mut snap = MarketSnapshot::new(data, &self.cfg)
            .with_pattern(pattern)
            .with_zones(zones)
            .with_structure(structure, &self.cfg)
            .with_ml(ml)
            .with_news(signals.news)
            .with_exposure(exposure)
            .with_pattern_stats(stats, tuned)
            .with_reentry_since(reentry_since);
        snap.pattern_validity = profile.pattern_validity();
        (snap, degraded)
    }

    async fn enter<G>(
        &mut self,
        pattern: &PatternSignal,
        snap: &MarketSnapshot,
        report: &ConfluenceReport,
        profile: &TradingProfile,
        gw: &mut G,
    ) -> EntryOutcome
    where
        G: ExecutionGateway + ?Sized,
    {
        let key = (pattern.name.clone(), pattern.direction, pattern.detected_at);
        let has_ticket = self.reentry.find(&pattern.name, pattern.direction).is_some();
        if self.traded_setups.contains(&key) && !has_ticket {
            debug!("{} {} already traded", pattern.name, pattern.direction);
            return EntryOutcome::AlreadyTraded;
        }
        if !self.lifecycle.has_room() {
            warn!("Position registry full, skipping {} {}", pattern.name, pattern.direction);
            return EntryOutcome::NoCapacity;
        }

        let sizing = SizingContext {
            balance: self.risk.balance(),
            risk_scale: self.risk.risk_scale(),
            symbol_exposure: self.lifecycle.live_volume(),
        };
        let spec = match self.planner.plan(pattern, snap, report, profile, sizing) {
            Ok(s) => s,
            Err(e) => {
                warn!("Order for {} {} not planned: {}", pattern.name, pattern.direction, e);
                return EntryOutcome::Rejected(e.to_string());
            }
        };

        let placement = match gw.place_order(&spec).await {
            Ok(p) => p,
            Err(e) => {
                warn!("Order for {} {} rejected: {}", pattern.name, pattern.direction, e);
                return EntryOutcome::Rejected(e.to_string());
            }
        };

        let attempt = match self.reentry.consume(&pattern.name, pattern.direction) {
            Some(ticket) => ticket.attempts_used + 1,
            None => 0,
        };
        let now = snap.now();
        if let Err(e) = self.lifecycle.register_pending(placement.id, &spec, attempt, now).map(|_| ()) {
            warn!("Placed #{} but could not track it: {}", placement.id, e);
            self.unwind(placement.id, placement.filled_price.is_some(), &spec, &snap.data.quote, gw)
                .await;
            return EntryOutcome::Rejected(e.to_string());
        }
        if let Some(price) = placement.filled_price {
            self.lifecycle.on_fill(placement.id, price, now);
        }
        self.risk.on_trade_opened();
        self.traded_setups.insert(key);

        info!(
            "ENTER {} {} #{} {} @ {:.5} SL {:.5} TP {:.5}/{:.5}/{:.5} vol {:.2}{}",
            spec.direction,
            spec.pattern,
            placement.id,
            spec.style,
            spec.entry_price,
            spec.stop_loss,
            spec.take_profits[0].price,
            spec.take_profits[1].price,
            spec.take_profits[2].price,
            spec.volume,
            if attempt > 0 { format!(" (re-entry {})", attempt) } else { String::new() }
        );
        EntryOutcome::Placed {
            id: placement.id,
            filled: placement.filled_price.is_some(),
            reentry_attempt: attempt,
        }
    }

    /// Back out an order the lifecycle refused to track.
    async fn unwind<G>(&mut self, id: u64, filled: bool, spec: &OrderSpec, quote: &Quote, gw: &mut G)
    where
        G: ExecutionGateway + ?Sized,
    {
        let result = if filled {
            gw.close_volume(id, spec.volume, quote.exit_side(spec.direction))
                .await
                .map(|_| ())
        } else {
            gw.cancel_order(id).await
        };
        if let Err(e) = result {
            warn!("Could not unwind #{}: {}", id, e);
        }
    }

    async fn reconcile<G>(
        &mut self,
        gw: &mut G,
        quote: &Quote,
        now: DateTime<Utc>,
        last_close: f64,
        atr: f64,
        log: &mut PassLog,
    ) -> Result<()>
    where
        G: ExecutionGateway + ?Sized,
    {
        for event in gw.poll_events().await {
            match event {
                ExecutionEvent::Filled { id, price, time } => {
                    self.lifecycle.on_fill(id, price, time);
                }
                ExecutionEvent::Closed { id, price, time } => {
                    if let Some(trade) = self.lifecycle.on_external_close(id, price, time) {
                        self.record_close(trade, last_close, atr, log);
                    }
                }
            }
        }

        let held = match gw.open_positions().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Open-position query failed, skipping reconciliation: {}", e);
                return Ok(());
            }
        };
        for id in &held {
            if self.lifecycle.get(*id).is_none() {
                warn!("Gateway holds untracked position #{}; ignoring", id);
            }
        }
        let vanished: Vec<(u64, f64)> = self
            .lifecycle
            .positions()
            .iter()
            .filter(|p| p.state.is_live() && !held.contains(&p.id))
            .map(|p| (p.id, quote.exit_side(p.direction)))
            .collect();
        for (id, price) in vanished {
            warn!("#{} no longer held by the gateway, closing at {:.5}", id, price);
            if let Some(trade) = self.lifecycle.on_external_close(id, price, now) {
                self.record_close(trade, last_close, atr, log);
            }
        }
        Ok(())
    }

    /// Returns false when a pyramid add was held back or refused, so it
    /// never shows up as an executed action.
    async fn execute<G>(&mut self, action: &LifecycleAction, gw: &mut G, now: DateTime<Utc>) -> bool
    where
        G: ExecutionGateway + ?Sized,
    {
        match action {
            LifecycleAction::ModifyStop { id, stop, kind } => {
                if let Err(e) = gw.modify_stop(*id, *stop).await {
                    warn!("{:?} stop for #{} refused: {}", kind, id, e);
                }
            }
            LifecycleAction::ClosePartial { id, volume, price, level } => {
                if let Err(e) = gw.close_volume(*id, *volume, *price).await {
                    warn!("TP{} partial close for #{} refused: {}", level, id, e);
                }
            }
            LifecycleAction::Close { id, volume, price, reason } => {
                if let Err(e) = gw.close_volume(*id, *volume, *price).await {
                    warn!("Close ({}) for #{} refused: {}", reason, id, e);
                }
            }
            LifecycleAction::CancelPending { id } => {
                if let Err(e) = gw.cancel_order(*id).await {
                    warn!("Cancel of expired #{} refused: {}", id, e);
                }
            }
            LifecycleAction::OpenPyramid { root_id, level, spec } => {
                return self.open_pyramid(*root_id, *level, spec, gw, now).await;
            }
        }
        true
    }

    /// An add is a new position: it needs an open gate and is sized like any
    /// entry, scaled by the pyramid volume factor and held under the lot caps.
    async fn open_pyramid<G>(
        &mut self,
        root_id: u64,
        level: u32,
        spec: &OrderSpec,
        gw: &mut G,
        now: DateTime<Utc>,
    ) -> bool
    where
        G: ExecutionGateway + ?Sized,
    {
        let gate = self.risk.gate();
        if !gate.is_open() {
            debug!("Pyramid level {} on #{} held back: {:?}", level, root_id, gate);
            self.lifecycle.release_pyramid(root_id);
            return false;
        }

        let profile = self.profiles.active();
        let volume = match self.planner.position_size(
            self.risk.balance(),
            profile.risk_per_trade_pct * self.cfg.lifecycle.pyramid_volume_factor,
            self.risk.risk_scale(),
            spec.stop_distance(),
            self.lifecycle.live_volume(),
        ) {
            Ok(v) => v,
            Err(e) => {
                debug!("Pyramid level {} on #{} not sized: {}", level, root_id, e);
                self.lifecycle.release_pyramid(root_id);
                return false;
            }
        };
        let spec = OrderSpec { volume, ..spec.clone() };

        match gw.place_order(&spec).await {
            Ok(p) => {
                if let Err(e) = self.lifecycle.register_pyramid(p.id, root_id, level, &spec, now) {
                    warn!("Pyramid #{} on #{} untracked: {}", p.id, root_id, e);
                    self.lifecycle.release_pyramid(root_id);
                    let quote = self.last_quote.unwrap_or_else(|| Quote::at(spec.entry_price, now));
                    self.unwind(p.id, p.filled_price.is_some(), &spec, &quote, gw).await;
                    return false;
                }
                if let Some(price) = p.filled_price {
                    self.lifecycle.on_fill(p.id, price, now);
                }
                self.risk.on_trade_opened();
                info!("Pyramid #{} on #{} level {} vol {:.2}", p.id, root_id, level, volume);
                true
            }
            Err(e) => {
                warn!("Pyramid level {} on #{} rejected: {}", level, root_id, e);
                self.lifecycle.release_pyramid(root_id);
                false
            }
        }
    }

    /// Close one tracked position at market (pending orders are cancelled).
    #[allow(clippy::too_many_arguments)]
    async fn close_position<G>(
        &mut self,
        id: u64,
        quote: &Quote,
        now: DateTime<Utc>,
        last_close: f64,
        atr: f64,
        gw: &mut G,
        log: &mut PassLog,
    ) -> bool
    where
        G: ExecutionGateway + ?Sized,
    {
        let Some(pos) = self.lifecycle.get(id) else {
            return false;
        };
        let (state, direction, volume) = (pos.state, pos.direction, pos.remaining_volume);

        let mut price = quote.exit_side(direction);
        if state == PositionState::Pending {
            if let Err(e) = gw.cancel_order(id).await {
                warn!("Cancel of #{} refused: {}", id, e);
            }
        } else {
            match gw.close_volume(id, volume, price).await {
                Ok(fill) => price = fill,
                Err(ExecutionError::UnknownOrder(_)) => {
                    debug!("#{} already gone at the gateway", id);
                }
                Err(e) => {
                    warn!("Close of #{} refused: {}", id, e);
                    return false;
                }
            }
        }

        match self.lifecycle.close_manual(id, price, now) {
            Ok(Some(trade)) => {
                self.record_close(trade, last_close, atr, log);
                log.actions.push(LifecycleAction::Close {
                    id,
                    volume,
                    price,
                    reason: crate::models::CloseReason::Manual,
                });
                true
            }
            Ok(None) => {
                log.actions.push(LifecycleAction::CancelPending { id });
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn record_close(&mut self, trade: ClosedTrade, last_close: f64, atr: f64, log: &mut PassLog) {
        self.risk.on_position_closed(trade.pnl);
        if trade.pyramid_level == 0 {
            self.reentry.on_close(&trade, last_close, atr);
        }
        self.history.push(trade.clone());

        let stats = TradingStats::from_trades(&self.history);
        self.tuner.refine(&stats.by_pattern);
        info!(
            "CLOSED #{} {} {} {:+.2} | balance {:.2} | {} trades, {:.1}% wins",
            trade.id,
            trade.reason,
            trade.pattern,
            trade.pnl,
            self.risk.balance(),
            stats.total_trades,
            stats.win_rate
        );
        log.closed.push(trade);
    }

    async fn apply_commands<G>(&mut self, data: &MarketData, atr: f64, gw: &mut G, log: &mut PassLog)
    where
        G: ExecutionGateway + ?Sized,
    {
        let quote = data.quote;
        let now = data.now;
        let last_close = data.candles.last().map_or(quote.mid(), |c| c.close);

        while let Some(env) = self.commands.pop_front() {
            info!("Applying command {}: {:?}", env.command_id, env.command);
            match env.command {
                OperatorCommand::ClosePosition { id } => {
                    if self.lifecycle.get(id).is_none() {
                        let err = CommandError::UnknownPosition {
                            command_id: env.command_id.clone(),
                            position_id: id,
                        };
                        warn!("{}", err);
                        log.rejected_commands.push(err.to_string());
                        continue;
                    }
                    self.close_position(id, &quote, now, last_close, atr, gw, log).await;
                }
                OperatorCommand::CloseAll => {
                    for id in self.lifecycle.ids() {
                        self.close_position(id, &quote, now, last_close, atr, gw, log).await;
                    }
                }
                OperatorCommand::PlaceMarket { direction, lots } => {
                    if let Err(e) = self.place_manual(direction, lots, &data.candles, &quote, atr, now, gw).await {
                        warn!("Command {} rejected: {}", env.command_id, e);
                        log.rejected_commands.push(format!("{}: {}", env.command_id, e));
                    }
                }
                OperatorCommand::SetFilter { filter, active } => {
                    self.registry.set_active(filter, active);
                }
                OperatorCommand::SelectProfile { name } => {
                    let selected = TradingProfile::preset(&name).and_then(|p| self.profiles.select(p));
                    if let Err(e) = selected {
                        warn!("Command {} rejected: {}", env.command_id, e);
                        log.rejected_commands.push(format!("{}: {}", env.command_id, e));
                    }
                }
                OperatorCommand::HaltTrading => self.risk.set_operator_halt(true),
                OperatorCommand::ResumeTrading => self.risk.set_operator_halt(false),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_manual<G>(
        &mut self,
        direction: Direction,
        lots: f64,
        candles: &CandleSeries,
        quote: &Quote,
        atr: f64,
        now: DateTime<Utc>,
        gw: &mut G,
    ) -> Result<u64>
    where
        G: ExecutionGateway + ?Sized,
    {
        let profile = self.profiles.active();
        let entry = quote.entry_side(direction);
        let stop = self.planner.stop_engine().initial_stop(
            entry,
            direction,
            candles,
            None,
            atr,
            self.cfg.decision.stop_atr_mult,
        );
        let risk = (entry - stop.price).abs();
        let take_profits = [0usize, 1, 2].map(|i| TakeProfitLevel {
            price: entry + direction.sign() * risk * profile.tp_r_multiples[i],
            close_pct: self.cfg.lifecycle.tp_close_pcts[i],
            r_multiple: profile.tp_r_multiples[i],
        });
        let spec = OrderSpec {
            direction,
            style: OrderStyle::Market,
            entry_price: entry,
            stop_loss: stop.price,
            take_profits,
            volume: lots,
            expiry: None,
            pattern: "manual".to_string(),
            stop_mode: stop.mode,
            reason: "operator command".to_string(),
        };
        if !spec.is_well_formed() {
            return Err(ExecutionError::InvalidStops(stop.reason).into());
        }

        let placement = gw.place_order(&spec).await?;
        if let Err(e) = self.lifecycle.register_pending(placement.id, &spec, 0, now).map(|_| ()) {
            self.unwind(placement.id, placement.filled_price.is_some(), &spec, quote, gw)
                .await;
            return Err(e.into());
        }
        if let Some(price) = placement.filled_price {
            self.lifecycle.on_fill(placement.id, price, now);
        }
        Ok(placement.id)
    }

    fn prune_traded_setups(&mut self, now: DateTime<Utc>, validity: Duration) {
        // Twice the window covers re-entries armed near its end
        let horizon = validity * 2;
        self.traded_setups.retain(|(_, _, at)| now - *at <= horizon);
    }

    /// Read-only dashboard view.
    pub fn state_snapshot(&self, now: DateTime<Utc>) -> StateSnapshot {
        let contract = self.cfg.instrument.contract_size;
        let positions = self
            .lifecycle
            .positions()
            .iter()
            .map(|p| PositionSummary {
                id: p.id,
                direction: p.direction,
                state: p.state,
                entry_price: p.entry_price,
                stop_loss: p.stop_loss,
                remaining_volume: p.remaining_volume,
                pattern: p.pattern.clone(),
                pyramid_level: p.pyramid_level,
                reentry_attempt: p.reentry_attempt,
                floating_pnl: self
                    .last_quote
                    .map_or(0.0, |q| p.floating_pnl(q.exit_side(p.direction), contract)),
                frozen: p.frozen,
            })
            .collect();

        let filters = match &self.last_report {
            Some(r) => r
                .results
                .iter()
                .map(|f| FilterState {
                    number: f.id.number(),
                    name: f.id.name().to_string(),
                    active: f.active,
                    passed: f.passed,
                })
                .collect(),
            None => FilterId::ALL
                .iter()
                .map(|id| FilterState {
                    number: id.number(),
                    name: id.name().to_string(),
                    active: self.registry.is_active(*id),
                    passed: false,
                })
                .collect(),
        };

        let state = self.risk.state();
        let gate = match self.risk.gate() {
            GateStatus::Open => "open".to_string(),
            GateStatus::Halted(r) => format!("halted: {}", r),
        };

        StateSnapshot {
            schema_version: SCHEMA_VERSION,
            generated_at: now,
            symbol: self.cfg.instrument.symbol.clone(),
            profile: self.profiles.active().name.clone(),
            bias: self.last_bias,
            regime: self.last_regime,
            confluence: self.last_report.as_ref().map(|r| ConfluenceSummary {
                score: r.score,
                active: r.active,
                required: r.required,
                decision: r.decision,
            }),
            filters,
            positions,
            risk: RiskSummary {
                balance: state.balance,
                realized_today: state.realized_today,
                realized_week: state.realized_week,
                drawdown_pct: state.drawdown_pct(),
                risk_scale: self.risk.risk_scale(),
                consecutive_losses: state.consecutive_losses,
                trades_today: state.trades_today,
                gate,
            },
            reentry_tickets: self.reentry.len(),
            degraded: self.last_degraded,
        }
    }
}
