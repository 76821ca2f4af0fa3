use chrono::{DateTime, Datelike, IsoWeek, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::config::RiskLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    DailyLoss,
    WeeklyLoss,
    AccountProfitTarget,
    SymbolProfitTarget,
    MaxTradesPerDay,
    ConsecutiveLosses,
    Operator,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaltReason::DailyLoss => "daily loss limit",
            HaltReason::WeeklyLoss => "weekly loss limit",
            HaltReason::AccountProfitTarget => "account profit target",
            HaltReason::SymbolProfitTarget => "symbol profit target",
            HaltReason::MaxTradesPerDay => "max trades per day",
            HaltReason::ConsecutiveLosses => "consecutive losses",
            HaltReason::Operator => "operator halt",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateStatus {
    Open,
    Halted(HaltReason),
}

impl GateStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, GateStatus::Open)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub balance: f64,
    pub day_start_balance: f64,
    pub week_start_balance: f64,
    pub peak_balance: f64,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    pub trades_today: u32,
    pub realized_today: f64,
    pub realized_week: f64,
    pub day: Option<NaiveDate>,
    pub week: Option<(i32, u32)>,
}

impl RiskState {
    fn new(balance: f64) -> Self {
        Self {
            balance,
            day_start_balance: balance,
            week_start_balance: balance,
            peak_balance: balance,
            consecutive_wins: 0,
            consecutive_losses: 0,
            trades_today: 0,
            realized_today: 0.0,
            realized_week: 0.0,
            day: None,
            week: None,
        }
    }

    pub fn drawdown_pct(&self) -> f64 {
        if self.peak_balance <= 0.0 {
            return 0.0;
        }
        ((self.peak_balance - self.balance) / self.peak_balance * 100.0).max(0.0)
    }
}

/// Account-level circuit breakers and the drawdown-aware risk multiplier.
pub struct RiskGovernor {
    limits: RiskLimits,
    state: RiskState,
    /// Halts that hold until the next daily rollover.
    latched: Option<HaltReason>,
    operator_halt: bool,
}

fn week_key(w: IsoWeek) -> (i32, u32) {
    (w.year(), w.week())
}

impl RiskGovernor {
    pub fn new(limits: RiskLimits, balance: f64) -> Self {
        Self {
            limits,
            state: RiskState::new(balance),
            latched: None,
            operator_halt: false,
        }
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn balance(&self) -> f64 {
        self.state.balance
    }

    pub fn gate(&self) -> GateStatus {
        if self.operator_halt {
            return GateStatus::Halted(HaltReason::Operator);
        }
        if let Some(reason) = self.latched {
            return GateStatus::Halted(reason);
        }
        let s = &self.state;
        let daily_limit = s.day_start_balance * self.limits.daily_loss_pct / 100.0;
        if daily_limit > 0.0 && -s.realized_today >= daily_limit - 1e-9 {
            return GateStatus::Halted(HaltReason::DailyLoss);
        }
        let weekly_limit = s.week_start_balance * self.limits.weekly_loss_pct / 100.0;
        if weekly_limit > 0.0 && -s.realized_week >= weekly_limit - 1e-9 {
            return GateStatus::Halted(HaltReason::WeeklyLoss);
        }
        if self.limits.max_trades_per_day > 0 && s.trades_today >= self.limits.max_trades_per_day {
            return GateStatus::Halted(HaltReason::MaxTradesPerDay);
        }
        GateStatus::Open
    }

    pub fn may_trade(&self) -> bool {
        self.gate().is_open()
    }

    /// Multiplier on the profile's base risk, in `[min_risk_scale, 1]`.
    pub fn risk_scale(&self) -> f64 {
        let dd = self.state.drawdown_pct() * self.limits.drawdown_sensitivity;
        let streak = self.state.consecutive_losses as f64 * self.limits.loss_streak_step;
        (1.0 - dd - streak).clamp(self.limits.min_risk_scale.min(1.0), 1.0)
    }

    pub fn on_trade_opened(&mut self) {
        self.state.trades_today += 1;
    }

    pub fn on_position_closed(&mut self, pnl: f64) {
        let s = &mut self.state;
        s.balance += pnl;
        s.realized_today += pnl;
        s.realized_week += pnl;
        if s.balance > s.peak_balance {
            s.peak_balance = s.balance;
        }
        if pnl > 0.0 {
            s.consecutive_wins += 1;
            s.consecutive_losses = 0;
        } else if pnl < 0.0 {
            s.consecutive_losses += 1;
            s.consecutive_wins = 0;
        }

        if self.limits.max_consecutive_losses > 0
            && s.consecutive_losses >= self.limits.max_consecutive_losses
            && self.latched.is_none()
        {
            warn!("{} consecutive losses, halting for the day", s.consecutive_losses);
            self.latched = Some(HaltReason::ConsecutiveLosses);
        }
        if let GateStatus::Halted(reason) = self.gate() {
            info!(
                "Trading halted: {} (today {:+.2}, week {:+.2})",
                reason, self.state.realized_today, self.state.realized_week
            );
        }
    }

    /// Roll day and ISO-week counters. Returns true when the day changed.
    pub fn rollover(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let week = week_key(today.iso_week());
        let s = &mut self.state;

        if s.day.is_none() {
            s.day = Some(today);
            s.week = Some(week);
            return false;
        }

        let mut new_day = false;
        if s.day != Some(today) {
            info!(
                "Daily rollover {} -> {}: realized {:+.2}, {} trades",
                s.day.map(|d| d.to_string()).unwrap_or_default(),
                today,
                s.realized_today,
                s.trades_today
            );
            s.day = Some(today);
            s.day_start_balance = s.balance;
            s.realized_today = 0.0;
            s.trades_today = 0;
            s.consecutive_losses = 0;
            self.latched = None;
            new_day = true;
        }
        if s.week != Some(week) {
            info!("Weekly rollover: realized {:+.2}", s.realized_week);
            s.week = Some(week);
            s.week_start_balance = s.balance;
            s.realized_week = 0.0;
        }
        new_day
    }

    /// Profit targets, as percentages of the day's starting balance. A hit
    /// latches the gate shut for the rest of the day; the caller flattens
    /// positions in scope. Returns the newly hit target, if any.
    pub fn check_profit_targets(&mut self, floating_account: f64, symbol_pnl: f64) -> Option<HaltReason> {
        if self.latched.is_some() {
            return None;
        }
        let base = self.state.day_start_balance;
        if let Some(pct) = self.limits.account_profit_target_pct {
            if self.state.realized_today + floating_account >= base * pct / 100.0 {
                info!("Account profit target {:.2}% reached", pct);
                self.latched = Some(HaltReason::AccountProfitTarget);
                return self.latched;
            }
        }
        if let Some(pct) = self.limits.symbol_profit_target_pct {
            if symbol_pnl >= base * pct / 100.0 {
                info!("Symbol profit target {:.2}% reached", pct);
                self.latched = Some(HaltReason::SymbolProfitTarget);
                return self.latched;
            }
        }
        None
    }

    pub fn set_operator_halt(&mut self, halted: bool) {
        if self.operator_halt != halted {
            info!("Operator {} trading", if halted { "halted" } else { "resumed" });
        }
        self.operator_halt = halted;
    }
}
