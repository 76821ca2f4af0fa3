mod common;

use chrono::Duration;
use std::io::Write;

use confluence_trader::backtesting::BacktestRunner;
use confluence_trader::dashboard::{CommandEnvelope, CommandQueue, OperatorCommand, StateExporter};
use confluence_trader::exchange::{ExecutionGateway, HistoricalFeed};
use confluence_trader::models::{Candle, CloseReason, Decision, Direction, PositionState};
use confluence_trader::strategies::BlockReason;
use confluence_trader::trading::{EntryOutcome, GateStatus, HaltReason, LifecycleAction, SignalBundle};

use common::*;

#[tokio::test]
async fn entry_runs_to_first_target_and_locks_break_even() {
    let (mut engine, mut gw) = engine_and_gateway(test_config("tp1"));
    let start = quiet_bars(30);
    let t0 = market_data(&start).now;

    let report = pass(&mut engine, &mut gw, &start, long_sweep(t0)).await;
    assert_eq!(report.decision, Decision::Enter);
    let (id, attempt) = placed(&report);
    assert_eq!(attempt, 0);

    let pos = engine.lifecycle().get(id).unwrap().clone();
    assert_eq!(pos.state, PositionState::Open);
    assert!(pos.stop_loss < pos.entry_price);
    let tp1 = pos.take_profits[0].price;
    assert!((tp1 - (pos.entry_price + 2.0 * pos.initial_risk)).abs() < 1e-9);

    // Price runs through TP1 but stays short of TP2
    let report = pass(&mut engine, &mut gw, &bars_then(&[tp1 + 0.00005]), SignalBundle::default()).await;
    assert!(report
        .actions
        .iter()
        .any(|a| matches!(a, LifecycleAction::ClosePartial { level: 1, .. })));

    let after = engine.lifecycle().get(id).unwrap();
    assert_eq!(after.state, PositionState::Partial1);
    assert!(after.break_even_moved);
    assert!(after.stop_loss >= pos.entry_price - 1e-9);
    assert!((after.remaining_volume - pos.original_volume * 0.5).abs() < 1e-9);
    assert!((gw.remaining_volume(id).unwrap() - after.remaining_volume).abs() < 1e-9);
    assert!((gw.stop_for(id).unwrap() - after.stop_loss).abs() < 1e-9);
    let locked = after.stop_loss;

    // Pullback through the protected stop closes the rest without a loss
    let bars = bars_then(&[tp1 + 0.00005, locked - 0.0002]);
    let report = pass(&mut engine, &mut gw, &bars, SignalBundle::default()).await;
    assert_eq!(report.closed.len(), 1);
    let trade = &report.closed[0];
    assert_eq!(trade.reason, CloseReason::Breakeven);
    assert!(trade.pnl > 0.0);
    assert!(engine.lifecycle().is_empty());
    assert!(engine.reentry().is_empty());
    assert!(gw.open_positions().await.unwrap().is_empty());
    assert!((gw.balance() - (10_000.0 + trade.pnl)).abs() < 1e-6);
}

#[tokio::test]
async fn pyramid_adds_once_per_level() {
    let mut cfg = test_config("pyramid");
    cfg.lifecycle.pyramid_enabled = true;
    let (mut engine, mut gw) = engine_and_gateway(cfg);
    let start = quiet_bars(30);
    let t0 = market_data(&start).now;
    let (root, _) = placed(&pass(&mut engine, &mut gw, &start, long_sweep(t0)).await);
    let pos = engine.lifecycle().get(root).unwrap().clone();

    // 1.6R is past the first pyramid trigger (1.5R) and short of TP1 (2R)
    let bars = bars_then(&[pos.entry_price + 1.6 * pos.initial_risk]);
    let report = pass(&mut engine, &mut gw, &bars, SignalBundle::default()).await;
    assert!(report
        .actions
        .iter()
        .any(|a| matches!(a, LifecycleAction::OpenPyramid { root_id, level: 1, .. } if *root_id == root)));
    assert_eq!(engine.lifecycle().len(), 2);
    assert_eq!(engine.lifecycle().pyramid_level(root), 1);
    let add = engine
        .lifecycle()
        .positions()
        .iter()
        .find(|p| p.id != root)
        .unwrap();
    assert_eq!(add.pyramid_level, 1);
    assert!(add.original_volume > 0.0);
    assert!(add.original_volume <= pos.original_volume * 0.5 + 1e-9);

    // Same price again: level 2 needs 3R, so nothing new
    let report = pass(&mut engine, &mut gw, &bars, SignalBundle::default()).await;
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, LifecycleAction::OpenPyramid { .. })));
    assert_eq!(engine.lifecycle().len(), 2);
    assert_eq!(gw.open_positions().await.unwrap().len(), 2);
}

#[tokio::test]
async fn pyramid_add_waits_for_an_open_gate() {
    let mut cfg = test_config("pyramid_gate");
    cfg.lifecycle.pyramid_enabled = true;
    let (mut engine, mut gw) = engine_and_gateway(cfg);
    let start = quiet_bars(30);
    let t0 = market_data(&start).now;
    let (root, _) = placed(&pass(&mut engine, &mut gw, &start, long_sweep(t0)).await);
    let pos = engine.lifecycle().get(root).unwrap().clone();
    let bars = bars_then(&[pos.entry_price + 1.6 * pos.initial_risk]);

    engine.enqueue(CommandEnvelope::new("halt", OperatorCommand::HaltTrading));
    let report = pass(&mut engine, &mut gw, &bars, SignalBundle::default()).await;
    assert_eq!(engine.risk().gate(), GateStatus::Halted(HaltReason::Operator));
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, LifecycleAction::OpenPyramid { .. })));
    assert_eq!(engine.lifecycle().len(), 1);
    assert_eq!(engine.lifecycle().pyramid_level(root), 0);
    assert_eq!(gw.open_positions().await.unwrap().len(), 1);
    assert_eq!(engine.risk().state().trades_today, 1);

    // Once trading resumes the same bar earns the add, counted as a trade
    engine.enqueue(CommandEnvelope::new("resume", OperatorCommand::ResumeTrading));
    pass(&mut engine, &mut gw, &bars, SignalBundle::default()).await;
    assert_eq!(engine.lifecycle().len(), 2);
    assert_eq!(engine.lifecycle().pyramid_level(root), 1);
    assert_eq!(engine.risk().state().trades_today, 2);
}

#[tokio::test]
async fn pyramid_add_stays_under_the_symbol_cap() {
    // (symbol cap, expected add volume): the root takes the full 0.5 per-trade cap
    for (cap, expected) in [(0.5, None), (0.6, Some(0.1))] {
        let mut cfg = test_config("pyramid_cap");
        cfg.lifecycle.pyramid_enabled = true;
        cfg.instrument.max_lot_per_trade = 0.5;
        cfg.instrument.max_lots_per_symbol = cap;
        let (mut engine, mut gw) = engine_and_gateway(cfg);
        let start = quiet_bars(30);
        let t0 = market_data(&start).now;
        let (root, _) = placed(&pass(&mut engine, &mut gw, &start, long_sweep(t0)).await);
        let pos = engine.lifecycle().get(root).unwrap().clone();
        assert!((pos.original_volume - 0.5).abs() < 1e-9);

        let bars = bars_then(&[pos.entry_price + 1.6 * pos.initial_risk]);
        pass(&mut engine, &mut gw, &bars, SignalBundle::default()).await;
        assert!(engine.lifecycle().live_volume() <= cap + 1e-9);

        let add = engine.lifecycle().positions().iter().find(|p| p.id != root).cloned();
        match expected {
            None => {
                assert!(add.is_none());
                assert_eq!(engine.lifecycle().pyramid_level(root), 0);
            }
            Some(volume) => {
                let add = add.unwrap();
                assert!((add.original_volume - volume).abs() < 1e-9);
                assert_eq!(engine.lifecycle().pyramid_level(root), 1);
            }
        }
    }
}

#[tokio::test]
async fn reentry_attempts_are_capped() {
    let mut cfg = test_config("reentry");
    cfg.risk.daily_loss_pct = 10.0;
    let (mut engine, mut gw) = engine_and_gateway(cfg);
    let mut closes: Vec<f64> = Vec::new();
    let t0 = market_data(&bars_then(&closes)).now;

    let (mut id, _) = placed(&pass(&mut engine, &mut gw, &bars_then(&closes), long_sweep(t0)).await);

    for round in 0..3u32 {
        let stop = engine.lifecycle().get(id).unwrap().stop_loss;
        closes.push(stop - 0.0003);
        let report = pass(&mut engine, &mut gw, &bars_then(&closes), SignalBundle::default()).await;
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].reason, CloseReason::Loss);
        assert_eq!(report.closed[0].reentry_attempt, round);

        // Price recovers and the same detection is offered again
        closes.push(1.1000);
        let report = pass(&mut engine, &mut gw, &bars_then(&closes), long_sweep(t0)).await;
        if round < 2 {
            let (next, attempt) = placed(&report);
            assert_eq!(attempt, round + 1);
            id = next;
        } else {
            assert_eq!(report.entry, Some(EntryOutcome::AlreadyTraded));
            assert!(engine.reentry().is_empty());
        }
    }
    assert_eq!(engine.history().len(), 3);
    assert_eq!(engine.risk().state().consecutive_losses, 3);
}

#[tokio::test]
async fn daily_loss_halts_until_rollover() {
    let mut cfg = test_config("halt");
    cfg.risk.daily_loss_pct = 0.5;
    let (mut engine, mut gw) = engine_and_gateway(cfg);
    let start = quiet_bars(30);
    let t0 = market_data(&start).now;
    let (id, _) = placed(&pass(&mut engine, &mut gw, &start, long_sweep(t0)).await);
    let stop = engine.lifecycle().get(id).unwrap().stop_loss;

    let bars = bars_then(&[stop - 0.0003]);
    let report = pass(&mut engine, &mut gw, &bars, SignalBundle::default()).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.gate, GateStatus::Halted(HaltReason::DailyLoss));

    // A fresh detection the same day is refused at the gate
    let bars = bars_then(&[stop - 0.0003, 1.1000]);
    let fresh = market_data(&bars).now;
    let report = pass(&mut engine, &mut gw, &bars, long_sweep(fresh)).await;
    assert_eq!(report.decision, Decision::Skip);
    assert_eq!(report.blocked_by, Some(BlockReason::RiskGate(HaltReason::DailyLoss)));
    assert!(report.entry.is_none());

    // Next morning the counters reset
    let mut data = market_data(&bars);
    data.now += Duration::days(1);
    data.quote.time = data.now;
    gw.on_quote(data.quote);
    let signals = long_sweep(data.now);
    let report = engine.run_pass(data, signals, &mut gw).await.unwrap();
    assert_eq!(report.gate, GateStatus::Open);
    assert!(matches!(report.entry, Some(EntryOutcome::Placed { .. })));
    assert_eq!(engine.risk().state().trades_today, 1);
}

#[tokio::test]
async fn account_profit_target_flattens_and_latches() {
    let mut cfg = test_config("target");
    cfg.risk.account_profit_target_pct = Some(1.0);
    let (mut engine, mut gw) = engine_and_gateway(cfg);
    let start = quiet_bars(30);
    let t0 = market_data(&start).now;
    let (id, _) = placed(&pass(&mut engine, &mut gw, &start, long_sweep(t0)).await);
    let pos = engine.lifecycle().get(id).unwrap().clone();

    let bars = bars_then(&[pos.entry_price + 1.2 * pos.initial_risk]);
    let report = pass(&mut engine, &mut gw, &bars, SignalBundle::default()).await;
    assert_eq!(report.closed.len(), 1);
    assert_eq!(report.closed[0].reason, CloseReason::Manual);
    assert!(report.closed[0].pnl > 0.0);
    assert_eq!(report.gate, GateStatus::Halted(HaltReason::AccountProfitTarget));
    assert!(engine.lifecycle().is_empty());
    assert!(gw.open_positions().await.unwrap().is_empty());
}

#[tokio::test]
async fn operator_commands_flow_through_the_inbox() {
    let cfg = test_config("inbox");
    std::fs::create_dir_all(&cfg.log_dir).unwrap();
    let _ = std::fs::remove_file(&cfg.command_inbox);
    let inbox = cfg.command_inbox.clone();
    let append = |line: &str| {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&inbox)
            .unwrap();
        writeln!(f, "{}", line).unwrap();
    };

    let mut queue = CommandQueue::new(&cfg.command_inbox);
    let (mut engine, mut gw) = engine_and_gateway(cfg);
    let start = quiet_bars(30);
    let t0 = market_data(&start).now;

    append(r#"{"command_id":"h1","type":"halt_trading"}"#);
    for cmd in queue.drain().await {
        engine.enqueue(cmd);
    }
    let report = pass(&mut engine, &mut gw, &start, long_sweep(t0)).await;
    assert_eq!(report.blocked_by, Some(BlockReason::RiskGate(HaltReason::Operator)));

    // A replayed id is ignored, a garbled line is skipped
    append(r#"{"command_id":"h1","type":"halt_trading"}"#);
    append("not json");
    append(r#"{"command_id":"r1","type":"resume_trading"}"#);
    append(r#"{"command_id":"m1","type":"place_market","direction":"short","lots":0.5}"#);
    let drained = queue.drain().await;
    assert_eq!(drained.len(), 2);
    for cmd in drained {
        engine.enqueue(cmd);
    }
    let report = pass(&mut engine, &mut gw, &start, long_sweep(t0)).await;
    assert!(report.rejected_commands.is_empty());
    assert!(matches!(report.entry, Some(EntryOutcome::Placed { .. })));
    assert_eq!(engine.lifecycle().len(), 2);
    let manual = engine
        .lifecycle()
        .positions()
        .iter()
        .find(|p| p.pattern == "manual")
        .unwrap();
    assert_eq!(manual.direction, Direction::Short);
    assert!((manual.original_volume - 0.5).abs() < 1e-9);

    append(r#"{"command_id":"x1","type":"close_all"}"#);
    for cmd in queue.drain().await {
        engine.enqueue(cmd);
    }
    let report = pass(&mut engine, &mut gw, &start, SignalBundle::default()).await;
    assert_eq!(report.closed.len(), 2);
    assert!(report.closed.iter().all(|t| t.reason == CloseReason::Manual));
    assert!(engine.lifecycle().is_empty());
    assert!(queue.drain().await.is_empty());

    // The dashboard sees the final state
    let export_path = engine.config().export_path.clone();
    let mut exporter = StateExporter::new(&export_path, std::time::Duration::from_secs(0));
    assert!(exporter.write(&engine.state_snapshot(t0)));
    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&export_path).unwrap()).unwrap();
    assert_eq!(written["positions"].as_array().map(|p| p.len()), Some(0));
    assert_eq!(written["risk"]["gate"], "open");
}

#[tokio::test]
async fn backtest_walks_every_bar_and_flattens() {
    let mut cfg = test_config("backtest");
    cfg.lifecycle.pyramid_enabled = true;
    let base = base_time();
    // Staircase: eight bars up, six bars down, repeated
    let candles: Vec<Candle> = (0..300)
        .map(|i| {
            let wave = (i / 14) as f64;
            let pos = i % 14;
            let step = 0.0004;
            let price = if pos < 8 {
                1.1000 + wave * step * 3.0 + pos as f64 * step
            } else {
                1.1000 + wave * step * 3.0 + 8.0 * step - (pos - 8) as f64 * step
            };
            Candle {
                timestamp: base + Duration::minutes(15 * i as i64),
                open: price,
                high: price + step * 0.8,
                low: price - step * 0.6,
                close: price + step * 0.3,
                volume: 100.0 + (i % 5) as f64 * 20.0,
            }
        })
        .collect();

    let feed = HistoricalFeed::new("EURUSD", cfg.profile.timeframe, candles, cfg.data_lookback).with_spread(0.0001);
    let mut runner = BacktestRunner::new(feed, cfg).unwrap().with_registry(all_pass_registry());
    let report = runner.run().await.unwrap();

    assert_eq!(report.counters.bars, 300);
    assert_eq!(report.equity_curve.len(), 300);
    assert!(report.counters.entries <= report.counters.enter_decisions);
    assert!(runner.engine.lifecycle().is_empty());
    assert!(runner.gateway.open_positions().await.unwrap().is_empty());
    assert_eq!(report.stats.total_trades, runner.engine.history().len());
    assert!((report.final_balance - runner.gateway.balance()).abs() < 1e-9);
    assert!(report.max_drawdown >= 0.0);
}
