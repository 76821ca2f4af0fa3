use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use confluence_trader::config::Config;
use confluence_trader::dashboard::{CommandQueue, StateExporter};
use confluence_trader::exchange::{ExecutionGateway, FileFeed, MarketFeed, PaperGateway};
use confluence_trader::signals::{self, FileMlProvider, StructurePatternDetector, SwingZoneDetector};
use confluence_trader::trading::{EntryOutcome, SignalBundle, TradingEngine};

const STATUS_INTERVAL: f64 = 300.0;

pub struct ConfluenceBot {
    config: Config,
    feed: FileFeed,
    gateway: PaperGateway,
    engine: TradingEngine,
    patterns: StructurePatternDetector,
    zones: SwingZoneDetector,
    ml: Option<FileMlProvider>,
    exporter: StateExporter,
    commands: CommandQueue,

    last_poll: Instant,
    last_status: Instant,
    passes: usize,
}

impl ConfluenceBot {
    pub fn new(config: Config) -> Result<Self> {
        info!("{}", "=".repeat(60));
        info!("Confluence trader starting up");
        info!("Mode: {}", if config.paper_trade { "PAPER TRADING" } else { "LIVE TRADING" });
        info!(
            "Symbol: {} | Profile: {} ({}) | Risk: {:.2}% | Min confluence: {}",
            config.instrument.symbol,
            config.profile.name,
            config.profile.timeframe,
            config.profile.risk_per_trade_pct,
            config.profile.min_confluence
        );
        info!("Bars: {} | Commands: {}", config.feed_path, config.command_inbox);
        if !config.disabled_filters.is_empty() {
            let names: Vec<&str> = config.disabled_filters.iter().map(|f| f.name()).collect();
            info!("Disabled filters: {}", names.join(", "));
        }
        info!("ML opinion: {}", if config.ml_enabled { config.ml_channel_dir.as_str() } else { "off" });
        info!("{}", "=".repeat(60));

        let spread = config.sim_spread_pips * config.instrument.pip_size;
        let feed = FileFeed::new(
            &config.feed_path,
            &config.instrument.symbol,
            config.profile.timeframe,
            config.data_lookback,
        )
        .with_spread(spread);
        let ml = config
            .ml_enabled
            .then(|| FileMlProvider::new(&config.ml_channel_dir, config.decision.atr_period));
        let now = Instant::now();

        Ok(Self {
            feed,
            gateway: PaperGateway::new(config.instrument.clone(), config.initial_balance),
            engine: TradingEngine::new(config.clone())?,
            patterns: StructurePatternDetector::new(&config),
            zones: SwingZoneDetector::new(&config),
            ml,
            exporter: StateExporter::new(&config.export_path, Duration::from_secs(config.export_interval_secs)),
            commands: CommandQueue::new(&config.command_inbox),
            last_poll: now,
            last_status: now,
            passes: 0,
            config,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Bot is now running. Press Ctrl+C to stop.");
        self.print_status().await;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    self.shutdown().await;
                    return Ok(());
                }
                _ = self.tick() => {}
            }
        }
    }

    async fn tick(&mut self) {
        // Operator commands wait for the next pass
        for cmd in self.commands.drain().await {
            self.engine.enqueue(cmd);
        }

        if self.last_poll.elapsed().as_secs() >= self.config.loop_interval_secs {
            self.last_poll = Instant::now();
            if let Err(e) = self.poll_bar().await {
                error!("Pass failed: {:#}", e);
            }
        }

        if self.exporter.due() {
            let snapshot = self.engine.state_snapshot(chrono::Utc::now());
            self.exporter.write(&snapshot);
        }

        if self.last_status.elapsed().as_secs_f64() > STATUS_INTERVAL {
            self.print_status().await;
            self.last_status = Instant::now();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    async fn poll_bar(&mut self) -> Result<()> {
        let Some(data) = self.feed.next_snapshot().await? else {
            return Ok(());
        };
        self.gateway.on_quote(data.quote);

        // Step 1: ask every collaborator, each bounded by the signal timeout
        let timeout = self.config.signal_timeout();
        let pattern = signals::poll(&mut self.patterns, &data, timeout).await;
        let zones = signals::poll(&mut self.zones, &data, timeout).await;
        let ml = match self.ml.as_mut() {
            Some(provider) => Some(signals::poll(provider, &data, timeout).await),
            None => None,
        };

        // Step 2: one engine pass
        let signals = SignalBundle {
            pattern,
            zones,
            ml,
            news: Vec::new(),
        };
        let report = self.engine.run_pass(data, signals, &mut self.gateway).await?;
        self.passes += 1;

        // Step 3: surface what happened
        if report.degraded {
            warn!("Bar {} evaluated with degraded inputs", report.time.format("%H:%M"));
        }
        for anomaly in &report.anomalies {
            error!("Position #{} frozen in {}: {}", anomaly.id, anomaly.state, anomaly.detail);
        }
        match &report.entry {
            Some(EntryOutcome::Rejected(reason)) => warn!("Entry rejected: {}", reason),
            Some(EntryOutcome::NoCapacity) => warn!("Entry skipped: position registry full"),
            _ => {}
        }
        debug!(
            "Pass {}: {} {}/{} gate {:?}",
            self.passes, report.decision, report.confluence.score, report.confluence.active, report.gate
        );
        Ok(())
    }

    async fn print_status(&mut self) {
        let stats = self.engine.stats();
        let risk = self.engine.risk().state().clone();
        match self.gateway.account().await {
            Ok(acct) => info!(
                "Balance: ${:.2} | Equity: ${:.2} | Free margin: ${:.2}",
                acct.balance, acct.equity, acct.free_margin
            ),
            Err(e) => warn!("Account query failed: {}", e),
        }
        info!("Trades: {} | Win Rate: {}% | PnL: ${:+.2}", stats.total_trades, stats.win_rate, stats.total_pnl);
        info!(
            "Today: {} trades, ${:+.2} | Drawdown {:.1}% | Risk scale {:.2} | Gate {:?}",
            risk.trades_today,
            risk.realized_today,
            risk.drawdown_pct(),
            self.engine.risk().risk_scale(),
            self.engine.risk().gate()
        );
        info!(
            "Open: {} | Re-entry tickets: {} | Passes: {}",
            self.engine.lifecycle().len(),
            self.engine.reentry().len(),
            self.passes
        );
    }

    async fn shutdown(&mut self) {
        info!("Shutting down...");
        let snapshot = self.engine.state_snapshot(chrono::Utc::now());
        self.exporter.write(&snapshot);
        self.print_status().await;
        info!("Bot stopped.");
    }
}
