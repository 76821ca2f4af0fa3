mod common;

use chrono::Duration;
use proptest::prelude::*;

use confluence_trader::config::TradingProfile;
use confluence_trader::core::stop_loss::StopLossEngine;
use confluence_trader::filters::{FilterId, FilterRegistry, MarketSnapshot, Predicate};
use confluence_trader::models::{
    CloseReason, Decision, Direction, OrderSpec, OrderStyle, Quote, StopMode, TakeProfitLevel,
};
use confluence_trader::trading::lifecycle::TickContext;
use confluence_trader::trading::reentry::ReEntryBook;
use confluence_trader::trading::{ClosedTrade, LifecycleAction, LifecycleManager, SignalBundle};

use common::*;

const ENTRY: f64 = 1.1000;
const STOP: f64 = 1.0980;

fn long_market_spec() -> OrderSpec {
    let risk = ENTRY - STOP;
    let ladder = [(2.0, 50.0), (3.0, 30.0), (4.0, 20.0)];
    OrderSpec {
        direction: Direction::Long,
        style: OrderStyle::Market,
        entry_price: ENTRY,
        stop_loss: STOP,
        take_profits: ladder.map(|(r, pct)| TakeProfitLevel {
            price: ENTRY + risk * r,
            close_pct: pct,
            r_multiple: r,
        }),
        volume: 1.0,
        expiry: None,
        pattern: "liquidity_sweep".to_string(),
        stop_mode: StopMode::Structural,
        reason: "property".to_string(),
    }
}

fn opened_manager(pyramid: bool) -> LifecycleManager {
    let mut cfg = test_config("prop");
    cfg.lifecycle.pyramid_enabled = pyramid;
    let mut lm = LifecycleManager::new(
        cfg.lifecycle.clone(),
        cfg.instrument.clone(),
        StopLossEngine::new(cfg.decision.swing_lookback, 0.0002),
    );
    let t = base_time();
    lm.register_pending(1, &long_market_spec(), 0, t).unwrap();
    assert!(lm.on_fill(1, ENTRY, t));
    lm
}

/// Advance `lm` through `closes`, one bar each, calling `observe` after every step.
fn walk(lm: &mut LifecycleManager, closes: &[f64], mut observe: impl FnMut(&LifecycleManager, &[LifecycleAction])) {
    let profile = TradingProfile::intraday();
    for i in 1..=closes.len() {
        let data = market_data(&bars_then(&closes[..i]));
        let ctx = TickContext {
            quote: Quote::at(closes[i - 1], data.now),
            candles: &data.candles,
            atr: data.candles.atr(14),
            now: data.now,
        };
        let out = lm.advance(&ctx, &profile);
        observe(lm, &out.actions);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stop_only_tightens_and_volume_is_conserved(
        moves in prop::collection::vec(-25i32..60, 1..30)
    ) {
        let closes: Vec<f64> = moves.iter().map(|p| ENTRY + *p as f64 * 0.0001).collect();
        let mut lm = opened_manager(false);
        let mut last_stop = STOP;
        let mut closed_volume = 0.0;

        walk(&mut lm, &closes, |lm, actions| {
            for a in actions {
                match a {
                    LifecycleAction::ClosePartial { volume, .. } | LifecycleAction::Close { volume, .. } => {
                        closed_volume += volume;
                    }
                    LifecycleAction::ModifyStop { stop, .. } => {
                        assert!(*stop >= last_stop - 1e-12, "stop moved back from {} to {}", last_stop, stop);
                        last_stop = *stop;
                    }
                    _ => {}
                }
            }
            if let Some(p) = lm.get(1) {
                assert!(p.stop_loss >= last_stop - 1e-12);
                last_stop = p.stop_loss;
            }
        });

        let remaining = lm.get(1).map_or(0.0, |p| p.remaining_volume);
        prop_assert!((closed_volume + remaining - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pyramid_levels_never_exceed_the_cap(
        steps in prop::collection::vec(0i32..15, 1..30)
    ) {
        // A path that only rises, up to ~4R above entry
        let mut price = ENTRY;
        let closes: Vec<f64> = steps
            .iter()
            .map(|s| {
                price = (price + *s as f64 * 0.0001).min(ENTRY + 0.0079);
                price
            })
            .collect();
        let mut lm = opened_manager(true);
        let mut adds = 0u32;

        walk(&mut lm, &closes, |lm, actions| {
            adds += actions
                .iter()
                .filter(|a| matches!(a, LifecycleAction::OpenPyramid { .. }))
                .count() as u32;
            assert!(lm.pyramid_level(1) <= 2);
        });
        prop_assert!(adds <= 2);
    }

    #[test]
    fn pyramid_exposure_never_exceeds_the_symbol_cap(
        steps in prop::collection::vec(0i32..15, 1..20),
        cap in 0.5f64..1.5,
    ) {
        let mut cfg = test_config("prop_cap");
        cfg.lifecycle.pyramid_enabled = true;
        cfg.instrument.max_lot_per_trade = 0.5;
        cfg.instrument.max_lots_per_symbol = cap;
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (mut engine, mut gw) = engine_and_gateway(cfg);
            let start = quiet_bars(30);
            let t0 = market_data(&start).now;
            placed(&pass(&mut engine, &mut gw, &start, long_sweep(t0)).await);

            let mut price = ENTRY;
            let mut closes = Vec::new();
            for s in &steps {
                price = (price + *s as f64 * 0.0001).min(ENTRY + 0.0079);
                closes.push(price);
                pass(&mut engine, &mut gw, &bars_then(&closes), SignalBundle::default()).await;
                let live = engine.lifecycle().live_volume();
                assert!(live <= cap + 1e-9, "exposure {} over cap {}", live, cap);
            }
        });
    }

    #[test]
    fn reentry_tickets_respect_the_attempt_cap(
        max_attempts in 0u32..4,
        attempt in 0u32..6,
    ) {
        let mut cfg = test_config("prop").reentry;
        cfg.max_attempts = max_attempts;
        cfg.cooldown_bars = 0;
        let mut book = ReEntryBook::new(cfg);
        let t = base_time();
        let trade = ClosedTrade {
            id: 7,
            direction: Direction::Long,
            pattern: "liquidity_sweep".to_string(),
            entry_price: ENTRY,
            exit_price: STOP,
            stop_loss: STOP,
            volume: 1.0,
            pnl: -200.0,
            reason: CloseReason::Loss,
            opened_at: Some(t),
            closed_at: t + Duration::minutes(5),
            pyramid_level: 0,
            reentry_attempt: attempt,
        };

        let ticket = book.on_close(&trade, STOP + 0.0001, 0.001).cloned();
        prop_assert_eq!(ticket.is_some(), attempt < max_attempts);
        if let Some(ticket) = ticket {
            prop_assert_eq!(ticket.attempts_used, attempt);
            let next = book.consume("liquidity_sweep", Direction::Long).unwrap();
            prop_assert!(next.attempts_used + 1 <= max_attempts);
        }
    }

    #[test]
    fn abstaining_filters_stay_out_of_the_denominator(
        outcomes in prop::collection::vec(0usize..3, 20),
        disabled in prop::collection::vec(any::<bool>(), 20),
    ) {
        let cfg = test_config("prop");
        let predicates: [Predicate; 3] = [|_, _| Some(true), |_, _| Some(false), |_, _| None];
        let mut registry = FilterId::ALL
            .iter()
            .zip(&outcomes)
            .fold(FilterRegistry::default(), |reg, (&id, &o)| reg.with_predicate(id, predicates[o]));
        for (&id, &off) in FilterId::ALL.iter().zip(&disabled) {
            if off {
                registry.set_active(id, false);
            }
        }

        let snap = MarketSnapshot::new(market_data(&quiet_bars(30)), &cfg);
        let report = registry.evaluate(&snap, &cfg.filters, &cfg.decision, &cfg.profile);

        let live = |want: usize| {
            outcomes
                .iter()
                .zip(&disabled)
                .filter(|(o, off)| !**off && **o == want)
                .count()
        };
        prop_assert_eq!(report.results.len(), 20);
        prop_assert_eq!(report.score, live(0));
        prop_assert_eq!(report.active, live(0) + live(1));
        prop_assert_eq!(report.passed.len() + report.failed.len(), report.active);
        if report.active == 0 {
            prop_assert_eq!(report.decision, Decision::Skip);
            prop_assert_eq!(report.ratio(), 0.0);
        } else if report.score >= report.required {
            prop_assert_eq!(report.decision, Decision::Enter);
        }
    }
}
