use chrono::{DateTime, Duration, Utc};

use crate::config::{
    default_sessions, Config, DecisionConfig, FilterThresholds, InstrumentSpec, LifecycleConfig, ReEntryConfig,
    RiskLimits, TradingProfile,
};
use crate::filters::MarketSnapshot;
use crate::models::{Candle, CandleSeries, Direction, OrderSpec, OrderStyle, Quote, StopMode, TakeProfitLevel, Timeframe};
use crate::signals::MarketData;

fn base_time() -> DateTime<Utc> {
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

/// Create n rising (bullish) candles starting from `start` price.
pub fn make_bullish_trend(n: usize, start: f64) -> CandleSeries {
    let base = base_time();
    let candles: Vec<Candle> = (0..n)
        .map(|i| {
            let open = start + i as f64 * 10.0;
            let close = open + 8.0;
            Candle {
                timestamp: base + Duration::minutes(i as i64),
                open,
                high: close + 2.0,
                low: open - 1.0,
                close,
                volume: 100.0,
            }
        })
        .collect();

    CandleSeries::new(candles)
}

/// Create n falling (bearish) candles starting from `start` price.
pub fn make_bearish_trend(n: usize, start: f64) -> CandleSeries {
    let base = base_time();
    let candles: Vec<Candle> = (0..n)
        .map(|i| {
            let open = start - i as f64 * 10.0;
            let close = open - 8.0;
            Candle {
                timestamp: base + Duration::minutes(i as i64),
                open,
                high: open + 1.0,
                low: close - 2.0,
                close,
                volume: 100.0,
            }
        })
        .collect();

    CandleSeries::new(candles)
}

/// EURUSD paper config with no profit targets and a temp log dir.
pub fn default_test_config() -> Config {
    let dir = std::env::temp_dir().join("confluence_trader_test");
    Config {
        instrument: InstrumentSpec {
            symbol: "EURUSD".to_string(),
            pip_size: 0.0001,
            contract_size: 100_000.0,
            min_lot: 0.01,
            lot_step: 0.01,
            max_lot_per_trade: 5.0,
            max_lots_per_symbol: 10.0,
            margin_rate: 1.0 / 30.0,
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
            pyramid_enabled: true,
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
            entry_style: OrderStyle::PendingStop,
            pending_offset_atr: 0.2,
            structural_targets: true,
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

/// Bars with a zero-spread quote at the last close; `now` is the last bar's time.
pub fn market_data(bars: &[(f64, f64, f64, f64)]) -> MarketData {
    let candles = make_candles(bars);
    let last = candles.last().map(|c| (c.close, c.timestamp)).unwrap();
    MarketData {
        symbol: "EURUSD".to_string(),
        timeframe: Timeframe::M15,
        candles,
        htf_candles: None,
        quote: Quote::at(last.0, last.1),
        now: last.1,
    }
}

/// Thirty quiet bars around 1.1000 with a one-pip spread.
pub fn neutral_snapshot(cfg: &Config) -> MarketSnapshot {
    let bars: Vec<(f64, f64, f64, f64)> = (0..30)
        .map(|i| {
            let o = 1.1000 + if i % 2 == 0 { 0.0002 } else { -0.0002 };
            (o, o + 0.0005, o - 0.0005, 1.1000)
        })
        .collect();
    let mut data = market_data(&bars);
    data.quote = Quote::new(1.1000, 1.1001, data.now);
    MarketSnapshot::new(data, cfg)
}

/// Long market order with a 2R/3R/4R ladder closing 50/30/20.
pub fn long_spec(entry: f64, stop: f64, volume: f64) -> OrderSpec {
    let risk = entry - stop;
    let ladder = [(2.0, 50.0), (3.0, 30.0), (4.0, 20.0)];
    OrderSpec {
        direction: Direction::Long,
        style: OrderStyle::Market,
        entry_price: entry,
        stop_loss: stop,
        take_profits: ladder.map(|(r, pct)| TakeProfitLevel {
            price: entry + risk * r,
            close_pct: pct,
            r_multiple: r,
        }),
        volume,
        expiry: None,
        pattern: "liquidity_sweep".to_string(),
        stop_mode: StopMode::Structural,
        reason: "test".to_string(),
    }
}
