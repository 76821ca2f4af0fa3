use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::error::ConfigError;
use crate::filters::FilterId;
use crate::models::{OrderStyle, Timeframe, TimeframeClass};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTime {
    pub start: (u32, u32),
    pub end: (u32, u32),
}

/// Named, immutable bundle of strategy parameters. Swapped wholesale through
/// [`ProfileSelector`]; never edited field by field while active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingProfile {
    pub name: String,
    pub timeframe: Timeframe,
    pub timeframe_class: TimeframeClass,
    pub risk_per_trade_pct: f64,
    pub tp_r_multiples: [f64; 3],
    pub pyramid_trigger_r: f64,
    pub break_even_trigger_r: f64,
    pub trailing_activation_r: f64,
    pub pattern_validity_bars: u32,
    pub pending_expiry_hours: u32,
    pub min_confluence: usize,
}

impl TradingProfile {
    // Faster timeframes: more filters must agree, less is risked per trade.
    pub fn scalper() -> Self {
        Self {
            name: "scalper".to_string(),
            timeframe: Timeframe::M5,
            timeframe_class: TimeframeClass::Scalping,
            risk_per_trade_pct: 0.5,
            tp_r_multiples: [1.0, 1.5, 2.5],
            pyramid_trigger_r: 1.0,
            break_even_trigger_r: 0.7,
            trailing_activation_r: 1.2,
            pattern_validity_bars: 6,
            pending_expiry_hours: 1,
            min_confluence: 7,
        }
    }

    pub fn intraday() -> Self {
        Self {
            name: "intraday".to_string(),
            timeframe: Timeframe::M15,
            timeframe_class: TimeframeClass::Intraday,
            risk_per_trade_pct: 1.0,
            tp_r_multiples: [2.0, 3.0, 4.0],
            pyramid_trigger_r: 1.5,
            break_even_trigger_r: 1.0,
            trailing_activation_r: 2.0,
            pattern_validity_bars: 10,
            pending_expiry_hours: 4,
            min_confluence: 5,
        }
    }

    pub fn swing() -> Self {
        Self {
            name: "swing".to_string(),
            timeframe: Timeframe::H4,
            timeframe_class: TimeframeClass::Swing,
            risk_per_trade_pct: 1.5,
            tp_r_multiples: [2.0, 4.0, 6.0],
            pyramid_trigger_r: 2.0,
            break_even_trigger_r: 1.5,
            trailing_activation_r: 3.0,
            pattern_validity_bars: 12,
            pending_expiry_hours: 24,
            min_confluence: 4,
        }
    }

    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name.to_lowercase().as_str() {
            "scalper" | "scalping" => Ok(Self::scalper()),
            "intraday" => Ok(Self::intraday()),
            "swing" => Ok(Self::swing()),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidProfile {
            profile: self.name.clone(),
            reason: reason.to_string(),
        };

        if !(self.risk_per_trade_pct > 0.0 && self.risk_per_trade_pct <= 10.0) {
            return Err(invalid("risk_per_trade_pct must be in (0, 10]"));
        }
        let [tp1, tp2, tp3] = self.tp_r_multiples;
        if !(tp1 > 0.0 && tp1 < tp2 && tp2 < tp3) {
            return Err(invalid("take-profit R multiples must be positive and ascending"));
        }
        if self.break_even_trigger_r <= 0.0
            || self.trailing_activation_r <= 0.0
            || self.pyramid_trigger_r <= 0.0
        {
            return Err(invalid("trigger R multiples must be positive"));
        }
        if self.min_confluence == 0 || self.min_confluence > FilterId::ALL.len() {
            return Err(invalid("min_confluence must be within 1..=20"));
        }
        if self.pattern_validity_bars == 0 {
            return Err(invalid("pattern_validity_bars must be at least 1"));
        }
        Ok(())
    }

    pub fn pattern_validity(&self) -> Duration {
        Duration::seconds(self.timeframe.as_duration().as_secs() as i64 * self.pattern_validity_bars as i64)
    }

    pub fn pending_expiry(&self) -> Duration {
        Duration::hours(self.pending_expiry_hours as i64)
    }
}

/// Holds the one active profile. Selection validates first and then replaces
/// the whole value, so readers never observe a half-updated profile.
#[derive(Debug, Clone)]
pub struct ProfileSelector {
    active: Arc<TradingProfile>,
}

impl ProfileSelector {
    pub fn new(profile: TradingProfile) -> Result<Self, ConfigError> {
        profile.validate()?;
        Ok(Self {
            active: Arc::new(profile),
        })
    }

    pub fn active(&self) -> Arc<TradingProfile> {
        Arc::clone(&self.active)
    }

    pub fn select(&mut self, profile: TradingProfile) -> Result<Arc<TradingProfile>, ConfigError> {
        profile.validate()?;
        info!("Trading profile switched: {} -> {}", self.active.name, profile.name);
        self.active = Arc::new(profile);
        Ok(self.active())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub pip_size: f64,
    pub contract_size: f64,
    pub min_lot: f64,
    pub lot_step: f64,
    pub max_lot_per_trade: f64,
    pub max_lots_per_symbol: f64,
    /// Margin required per unit of notional (1/leverage).
    pub margin_rate: f64,
}

impl InstrumentSpec {
    pub fn pips(&self, price_distance: f64) -> f64 {
        price_distance / self.pip_size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub daily_loss_pct: f64,
    pub weekly_loss_pct: f64,
    pub account_profit_target_pct: Option<f64>,
    pub symbol_profit_target_pct: Option<f64>,
    pub max_trades_per_day: u32,
    pub max_consecutive_losses: u32,
    /// Risk scale lost per 1% of drawdown below the peak balance.
    pub drawdown_sensitivity: f64,
    /// Risk scale lost per consecutive losing trade.
    pub loss_streak_step: f64,
    pub min_risk_scale: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub tp_close_pcts: [f64; 3],
    pub trailing_atr_mult: f64,
    pub structural_trailing: bool,
    pub break_even_lock_pips: f64,
    pub pyramid_enabled: bool,
    pub pyramid_max_level: u32,
    pub pyramid_volume_factor: f64,
    pub max_positions: usize,
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let total: f64 = self.tp_close_pcts.iter().sum();
        if total > 100.0 + 1e-9 || self.tp_close_pcts.iter().any(|p| *p < 0.0) {
            return Err(ConfigError::ClosePercentages(total));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReEntryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub cooldown_bars: u32,
    pub max_tickets: usize,
    /// Setup is considered broken once price closes this many ATRs past the stop.
    pub invalidation_atr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub atr_period: usize,
    pub swing_lookback: usize,
    pub stop_atr_mult: f64,
    pub stop_buffer_pips: f64,
    pub entry_style: OrderStyle,
    pub pending_offset_atr: f64,
    pub structural_targets: bool,
    pub confluence_sizing: bool,
    pub min_confluence_scale: f64,
    /// Below this pass ratio a non-entering bar is a SKIP rather than a WAIT.
    pub wait_ratio: f64,
    pub ml_veto_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterThresholds {
    pub max_spread_pips: f64,
    pub min_volume_ratio: f64,
    pub max_slippage_pips: f64,
    pub htf_ema_period: usize,
    pub max_correlated_positions: usize,
    pub min_atr_ratio: f64,
    pub max_atr_ratio: f64,
    pub sweep_lookback: usize,
    pub divergence_lookback: usize,
    pub min_pattern_win_rate: f64,
    pub min_pattern_samples: usize,
    pub min_pattern_strength: f64,
    pub ml_min_probability: f64,
    pub news_blackout_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub instrument: InstrumentSpec,
    pub profile: TradingProfile,

    // Account
    pub paper_trade: bool,
    pub initial_balance: f64,

    pub risk: RiskLimits,
    pub lifecycle: LifecycleConfig,
    pub reentry: ReEntryConfig,
    pub decision: DecisionConfig,
    pub filters: FilterThresholds,
    pub disabled_filters: Vec<FilterId>,

    // Sessions (ET wall clock)
    pub sessions: HashMap<String, SessionTime>,
    pub trade_sessions: Vec<String>,

    // External collaborators
    pub signal_timeout_ms: u64,
    pub ml_enabled: bool,
    pub ml_channel_dir: String,
    pub export_path: String,
    pub export_interval_secs: u64,
    pub command_inbox: String,
    pub loop_interval_secs: u64,

    // Bar source
    pub feed_path: String,
    pub data_lookback: usize,
    /// Spread applied to synthetic quotes built from bar closes.
    pub sim_spread_pips: f64,

    // Logging
    pub log_dir: String,
    pub log_level: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn default_sessions() -> HashMap<String, SessionTime> {
    let mut sessions = HashMap::new();
    sessions.insert(
        "asian".to_string(),
        SessionTime {
            start: (19, 0),
            end: (3, 0),
        },
    );
    sessions.insert(
        "london".to_string(),
        SessionTime {
            start: (3, 0),
            end: (8, 0),
        },
    );
    sessions.insert(
        "new_york".to_string(),
        SessionTime {
            start: (8, 0),
            end: (17, 0),
        },
    );
    sessions
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let env = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let mut profile = TradingProfile::preset(&env("TRADING_PROFILE", "intraday"))?;
        profile.risk_per_trade_pct = env_or("RISK_PER_TRADE_PCT", profile.risk_per_trade_pct);
        profile.min_confluence = env_or("MIN_CONFLUENCE", profile.min_confluence);
        if let Ok(tf) = std::env::var("TIMEFRAME") {
            profile.timeframe = Timeframe::from_str_loose(&tf).ok_or_else(|| ConfigError::InvalidProfile {
                profile: profile.name.clone(),
                reason: format!("unknown timeframe {}", tf),
            })?;
        }
        profile.validate()?;

        let disabled_filters = env("DISABLED_FILTERS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(FilterId::from_name)
            .collect();

        let cfg = Config {
            instrument: InstrumentSpec {
                symbol: env("SYMBOL", "EURUSD"),
                pip_size: env_or("PIP_SIZE", 0.0001),
                contract_size: env_or("CONTRACT_SIZE", 100_000.0),
                min_lot: env_or("MIN_LOT", 0.01),
                lot_step: env_or("LOT_STEP", 0.01),
                max_lot_per_trade: env_or("MAX_LOT_PER_TRADE", 5.0),
                max_lots_per_symbol: env_or("MAX_LOTS_PER_SYMBOL", 10.0),
                margin_rate: env_or("MARGIN_RATE", 1.0 / 30.0),
            },
            profile,
            paper_trade: env("PAPER_TRADE", "true").to_lowercase() == "true",
            initial_balance: env_or("INITIAL_BALANCE", 10_000.0),
            risk: RiskLimits {
                daily_loss_pct: env_or("DAILY_LOSS_PCT", 2.0),
                weekly_loss_pct: env_or("WEEKLY_LOSS_PCT", 5.0),
                account_profit_target_pct: env_opt("ACCOUNT_PROFIT_TARGET_PCT"),
                symbol_profit_target_pct: env_opt("SYMBOL_PROFIT_TARGET_PCT"),
                max_trades_per_day: env_or("MAX_TRADES_PER_DAY", 10),
                max_consecutive_losses: env_or("MAX_CONSECUTIVE_LOSSES", 5),
                drawdown_sensitivity: env_or("DRAWDOWN_SENSITIVITY", 0.05),
                loss_streak_step: env_or("LOSS_STREAK_STEP", 0.1),
                min_risk_scale: env_or("MIN_RISK_SCALE", 0.25),
            },
            lifecycle: LifecycleConfig {
                tp_close_pcts: [
                    env_or("TP1_CLOSE_PCT", 50.0),
                    env_or("TP2_CLOSE_PCT", 30.0),
                    env_or("TP3_CLOSE_PCT", 20.0),
                ],
                trailing_atr_mult: env_or("TRAILING_ATR_MULT", 1.5),
                structural_trailing: env("STRUCTURAL_TRAILING", "true").to_lowercase() == "true",
                break_even_lock_pips: env_or("BREAK_EVEN_LOCK_PIPS", 0.0),
                pyramid_enabled: env("PYRAMID_ENABLED", "true").to_lowercase() == "true",
                pyramid_max_level: env_or("PYRAMID_MAX_LEVEL", 2),
                pyramid_volume_factor: env_or("PYRAMID_VOLUME_FACTOR", 0.5),
                max_positions: env_or("MAX_POSITIONS", 8),
            },
            reentry: ReEntryConfig {
                enabled: env("REENTRY_ENABLED", "true").to_lowercase() == "true",
                max_attempts: env_or("REENTRY_MAX_ATTEMPTS", 2),
                cooldown_bars: env_or("REENTRY_COOLDOWN_BARS", 1),
                max_tickets: env_or("REENTRY_MAX_TICKETS", 10),
                invalidation_atr: env_or("REENTRY_INVALIDATION_ATR", 1.0),
            },
            decision: DecisionConfig {
                atr_period: env_or("ATR_PERIOD", 14),
                swing_lookback: env_or("SWING_LOOKBACK", 3),
                stop_atr_mult: env_or("STOP_ATR_MULT", 1.5),
                stop_buffer_pips: env_or("STOP_BUFFER_PIPS", 2.0),
                entry_style: OrderStyle::from_str_loose(&env("ENTRY_STYLE", "stop"))
                    .unwrap_or(OrderStyle::PendingStop),
                pending_offset_atr: env_or("PENDING_OFFSET_ATR", 0.2),
                structural_targets: env("STRUCTURAL_TARGETS", "true").to_lowercase() == "true",
                confluence_sizing: env("CONFLUENCE_SIZING", "false").to_lowercase() == "true",
                min_confluence_scale: env_or("MIN_CONFLUENCE_SCALE", 0.5),
                wait_ratio: env_or("WAIT_RATIO", 0.5),
                ml_veto_confidence: env_or("ML_VETO_CONFIDENCE", 0.8),
            },
            filters: FilterThresholds {
                max_spread_pips: env_or("MAX_SPREAD_PIPS", 2.5),
                min_volume_ratio: env_or("MIN_VOLUME_RATIO", 0.8),
                max_slippage_pips: env_or("MAX_SLIPPAGE_PIPS", 1.0),
                htf_ema_period: env_or("HTF_EMA_PERIOD", 20),
                max_correlated_positions: env_or("MAX_CORRELATED_POSITIONS", 3),
                min_atr_ratio: env_or("MIN_ATR_RATIO", 0.6),
                max_atr_ratio: env_or("MAX_ATR_RATIO", 2.5),
                sweep_lookback: env_or("SWEEP_LOOKBACK", 20),
                divergence_lookback: env_or("DIVERGENCE_LOOKBACK", 14),
                min_pattern_win_rate: env_or("MIN_PATTERN_WIN_RATE", 0.45),
                min_pattern_samples: env_or("MIN_PATTERN_SAMPLES", 10),
                min_pattern_strength: env_or("MIN_PATTERN_STRENGTH", 0.5),
                ml_min_probability: env_or("ML_MIN_PROBABILITY", 0.55),
                news_blackout_minutes: env_or("NEWS_BLACKOUT_MINUTES", 30),
            },
            disabled_filters,
            sessions: default_sessions(),
            trade_sessions: env("TRADE_SESSIONS", "london,new_york")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            signal_timeout_ms: env_or("SIGNAL_TIMEOUT_MS", 500),
            ml_enabled: env("ML_ENABLED", "false").to_lowercase() == "true",
            ml_channel_dir: env("ML_CHANNEL_DIR", "ml_channel"),
            export_path: env("EXPORT_PATH", "logs/state.json"),
            export_interval_secs: env_or("EXPORT_INTERVAL_SECS", 5),
            command_inbox: env("COMMAND_INBOX", "logs/commands.jsonl"),
            loop_interval_secs: env_or("LOOP_INTERVAL_SECS", 1),
            feed_path: env("FEED_PATH", "data/bars.json"),
            data_lookback: env_or("DATA_LOOKBACK", 300),
            sim_spread_pips: env_or("SIM_SPREAD_PIPS", 1.0),
            log_dir: env("LOG_DIR", "logs"),
            log_level: env("LOG_LEVEL", "info"),
        };

        cfg.lifecycle.validate()?;
        Ok(cfg)
    }

    pub fn signal_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.signal_timeout_ms)
    }
}
