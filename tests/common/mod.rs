#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};

use confluence_trader::config::{
    default_sessions, Config, DecisionConfig, FilterThresholds, InstrumentSpec, LifecycleConfig, ReEntryConfig,
    RiskLimits, TradingProfile,
};
use confluence_trader::exchange::PaperGateway;
use confluence_trader::filters::{FilterId, FilterRegistry};
use confluence_trader::models::{Candle, CandleSeries, Direction, OrderStyle, Quote, Timeframe};
use confluence_trader::signals::{MarketData, PatternSignal, SignalOutcome};
use confluence_trader::trading::{EntryOutcome, PassReport, SignalBundle, TradingEngine};

pub fn base_time() -> DateTime<Utc> {
    // Monday 07:00 New York, inside the London session
    DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Create candles from (open, high, low, close) tuples with auto-incrementing 1m timestamps.
pub fn make_candles(data: &[(f64, f64, f64, f64)]) -> CandleSeries {
    let base = base_time();
    let candles: Vec<Candle> = data
        .iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Candle {
            timestamp: base + Duration::minutes(i as i64),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
        })
        .collect();

    CandleSeries::new(candles)
}

/// Bars chopping one pip either side of 1.1000, every close at 1.1000.
pub fn quiet_bars(n: usize) -> Vec<(f64, f64, f64, f64)> {
    (0..n)
        .map(|i| {
            let o = 1.1000 + if i % 2 == 0 { 0.0002 } else { -0.0002 };
            (o, o + 0.0005, o - 0.0005, 1.1000)
        })
        .collect()
}

/// `quiet_bars(30)` followed by one bar per close in `closes`.
pub fn bars_then(closes: &[f64]) -> Vec<(f64, f64, f64, f64)> {
    let mut bars = quiet_bars(30);
    let mut prev = 1.1000;
    for &c in closes {
        bars.push((prev, prev.max(c), prev.min(c), c));
        prev = c;
    }
    bars
}

/// Zero-spread quote at the last close; `now` is the last bar's time.
pub fn market_data(bars: &[(f64, f64, f64, f64)]) -> MarketData {
    let candles = make_candles(bars);
    let (close, time) = candles.last().map(|c| (c.close, c.timestamp)).unwrap();
    MarketData {
        symbol: "EURUSD".to_string(),
        timeframe: Timeframe::M15,
        candles,
        htf_candles: None,
        quote: Quote::at(close, time),
        now: time,
    }
}

/// EURUSD paper account at 100:1 with market entries and a plain R ladder.
pub fn test_config(tag: &str) -> Config {
    let dir = std::env::temp_dir().join(format!("confluence_integ_{}_{}", tag, std::process::id()));
    Config {
        instrument: InstrumentSpec {
            symbol: "EURUSD".to_string(),
            pip_size: 0.0001,
            contract_size: 100_000.0,
            min_lot: 0.01,
            lot_step: 0.01,
            max_lot_per_trade: 5.0,
            max_lots_per_symbol: 10.0,
            margin_rate: 0.01,
        },
        profile: TradingProfile::intraday(),
        paper_trade: true,
        initial_balance: 10_000.0,
        risk: RiskLimits {
            daily_loss_pct: 2.0,
            weekly_loss_pct: 5.0,
            account_profit_target_pct: None,
            symbol_profit_target_pct: None,
            max_trades_per_day: 10,
            max_consecutive_losses: 5,
            drawdown_sensitivity: 0.05,
            loss_streak_step: 0.1,
            min_risk_scale: 0.25,
        },
        lifecycle: LifecycleConfig {
            tp_close_pcts: [50.0, 30.0, 20.0],
            trailing_atr_mult: 1.5,
            structural_trailing: true,
            break_even_lock_pips: 0.0,
            pyramid_enabled: false,
            pyramid_max_level: 2,
            pyramid_volume_factor: 0.5,
            max_positions: 8,
        },
        reentry: ReEntryConfig {
            enabled: true,
            max_attempts: 2,
            cooldown_bars: 1,
            max_tickets: 10,
            invalidation_atr: 1.0,
        },
        decision: DecisionConfig {
            atr_period: 14,
            swing_lookback: 3,
            stop_atr_mult: 1.5,
            stop_buffer_pips: 2.0,
            entry_style: OrderStyle::Market,
            pending_offset_atr: 0.2,
            structural_targets: false,
            confluence_sizing: false,
            min_confluence_scale: 0.5,
            wait_ratio: 0.5,
            ml_veto_confidence: 0.8,
        },
        filters: FilterThresholds {
            max_spread_pips: 2.5,
            min_volume_ratio: 0.8,
            max_slippage_pips: 1.0,
            htf_ema_period: 20,
            max_correlated_positions: 3,
            min_atr_ratio: 0.6,
            max_atr_ratio: 2.5,
            sweep_lookback: 20,
            divergence_lookback: 14,
            min_pattern_win_rate: 0.45,
            min_pattern_samples: 10,
            min_pattern_strength: 0.5,
            ml_min_probability: 0.55,
            news_blackout_minutes: 30,
        },
        disabled_filters: Vec::new(),
        sessions: default_sessions(),
        trade_sessions: vec!["london".to_string(), "new_york".to_string()],
        signal_timeout_ms: 200,
        ml_enabled: false,
        ml_channel_dir: dir.join("ml").to_string_lossy().to_string(),
        export_path: dir.join("state.json").to_string_lossy().to_string(),
        export_interval_secs: 5,
        command_inbox: dir.join("commands.jsonl").to_string_lossy().to_string(),
        loop_interval_secs: 1,
        feed_path: dir.join("bars.json").to_string_lossy().to_string(),
        data_lookback: 300,
        sim_spread_pips: 1.0,
        log_dir: dir.to_string_lossy().to_string(),
        log_level: "debug".to_string(),
    }
}

/// Registry whose twenty filters all pass, so tests drive the lifecycle
/// rather than the detectors.
pub fn all_pass_registry() -> FilterRegistry {
    FilterId::ALL
        .iter()
        .fold(FilterRegistry::default(), |reg, &id| reg.with_predicate(id, |_, _| Some(true)))
}

pub fn engine_and_gateway(cfg: Config) -> (TradingEngine, PaperGateway) {
    let gw = PaperGateway::new(cfg.instrument.clone(), cfg.initial_balance);
    let engine = TradingEngine::new(cfg).unwrap().with_registry(all_pass_registry());
    (engine, gw)
}

pub fn long_sweep(at: DateTime<Utc>) -> SignalBundle {
    SignalBundle {
        pattern: SignalOutcome::Ready(Some(PatternSignal {
            name: "liquidity_sweep".to_string(),
            strength: 0.8,
            direction: Direction::Long,
            detected_at: at,
        })),
        ..SignalBundle::default()
    }
}

pub async fn pass(
    engine: &mut TradingEngine,
    gw: &mut PaperGateway,
    bars: &[(f64, f64, f64, f64)],
    signals: SignalBundle,
) -> PassReport {
    let data = market_data(bars);
    gw.on_quote(data.quote);
    engine.run_pass(data, signals, gw).await.unwrap()
}

pub fn placed(report: &PassReport) -> (u64, u32) {
    match report.entry {
        Some(EntryOutcome::Placed { id, reentry_attempt, .. }) => (id, reentry_attempt),
        ref other => panic!("expected a placed order, got {:?}", other),
    }
}
