use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::Config;
use crate::dashboard::{CommandEnvelope, OperatorCommand};
use crate::error::ConfigError;
use crate::exchange::{ExecutionGateway, HistoricalFeed, MarketFeed, PaperGateway};
use crate::filters::FilterRegistry;
use crate::models::Decision;
use crate::signals::{MarketData, SignalOutcome, StructurePatternDetector, SwingZoneDetector};
use crate::trading::{EntryOutcome, SignalBundle, TradingEngine};

use super::report::{BacktestReport, RunCounters};

/// Steps a historical feed bar by bar through the full engine, with a paper
/// gateway standing in for the broker.
pub struct BacktestRunner {
    pub feed: HistoricalFeed,
    pub gateway: PaperGateway,
    pub engine: TradingEngine,
    patterns: StructurePatternDetector,
    zones: SwingZoneDetector,
    config: Config,
    counters: RunCounters,
}

impl BacktestRunner {
    pub fn new(feed: HistoricalFeed, config: Config) -> Result<Self, ConfigError> {
        let gateway = PaperGateway::new(config.instrument.clone(), config.initial_balance);
        let engine = TradingEngine::new(config.clone())?;
        Ok(Self {
            feed,
            gateway,
            engine,
            patterns: StructurePatternDetector::new(&config),
            zones: SwingZoneDetector::new(&config),
            config,
            counters: RunCounters::default(),
        })
    }

    /// Score with alternative filter detectors.
    pub fn with_registry(mut self, registry: FilterRegistry) -> Self {
        self.engine = self.engine.with_registry(registry);
        self
    }

    /// Run the whole feed. Positions still open at the end are closed at the
    /// last quote.
    pub async fn run(&mut self) -> Result<BacktestReport> {
        let total_bars = self.feed.remaining();
        let log_interval = total_bars / 20; // ~20 progress updates
        let start = self.feed.earliest_time().unwrap_or_else(Utc::now);
        let initial_balance = self.config.initial_balance;

        info!("=== BACKTEST START ===");
        info!(
            "{} {} | {} bars | profile {} | initial balance ${:.2}",
            self.config.instrument.symbol,
            self.config.profile.timeframe,
            total_bars,
            self.config.profile.name,
            initial_balance
        );

        // Equity curve tracking
        let mut equity_curve: Vec<(DateTime<Utc>, f64)> = Vec::new();
        let mut max_equity = initial_balance;
        let mut max_drawdown = 0.0f64;
        let mut max_drawdown_pct = 0.0f64;
        let mut last: Option<MarketData> = None;

        while let Some(data) = self.feed.next_snapshot().await? {
            let now = data.now;
            self.counters.bars += 1;

            if log_interval > 0 && self.counters.bars % log_interval == 0 {
                info!(
                    "  Progress: {:.0}% | {} | Balance: ${:.2} | Trades: {} | Entries: {}",
                    self.counters.bars as f64 / total_bars as f64 * 100.0,
                    now.format("%Y-%m-%d %H:%M"),
                    self.gateway.balance(),
                    self.engine.history().len(),
                    self.counters.entries,
                );
            }

            self.step(data.clone()).await?;
            last = Some(data);

            // Track equity
            let equity = self.gateway.account().await?.equity;
            equity_curve.push((now, equity));
            if equity > max_equity {
                max_equity = equity;
            }
            let dd = max_equity - equity;
            if dd > max_drawdown {
                max_drawdown = dd;
                max_drawdown_pct = if max_equity > 0.0 { dd / max_equity * 100.0 } else { 0.0 };
            }
        }

        if let Some(data) = last {
            if !self.engine.lifecycle().is_empty() {
                debug!("Flattening {} positions at end of data", self.engine.lifecycle().len());
                self.engine
                    .enqueue(CommandEnvelope::new("backtest-end", OperatorCommand::CloseAll));
                self.engine
                    .run_pass(data, SignalBundle::default(), &mut self.gateway)
                    .await
                    .context("final flatten pass")?;
            }
        }

        info!("=== BACKTEST COMPLETE ===");

        let end = self.feed.current_time().unwrap_or(start);
        Ok(BacktestReport::from_run(
            self.engine.history(),
            &self.config,
            start,
            end,
            self.gateway.balance(),
            equity_curve,
            max_drawdown,
            max_drawdown_pct,
            self.counters.clone(),
        ))
    }

    async fn step(&mut self, data: MarketData) -> Result<()> {
        self.gateway.on_quote(data.quote);

        let pattern = self.patterns.detect(&data);
        let zones = self.zones.detect(&data.candles, data.quote.mid());
        if pattern.is_some() {
            self.counters.bars_with_pattern += 1;
        }
        let signals = SignalBundle {
            pattern: SignalOutcome::Ready(pattern),
            zones: SignalOutcome::Ready(zones),
            ml: None,
            news: Vec::new(),
        };

        let report = self.engine.run_pass(data, signals, &mut self.gateway).await?;
        match report.decision {
            Decision::Enter => self.counters.enter_decisions += 1,
            Decision::Wait => self.counters.waits += 1,
            Decision::Skip => {}
        }
        if let Some(reason) = report.blocked_by {
            *self.counters.blocked.entry(reason.to_string()).or_default() += 1;
        }
        match &report.entry {
            Some(EntryOutcome::Placed { reentry_attempt, .. }) => {
                self.counters.entries += 1;
                if *reentry_attempt > 0 {
                    self.counters.reentries += 1;
                }
            }
            Some(EntryOutcome::Rejected(_)) => self.counters.rejections += 1,
            _ => {}
        }
        self.counters.anomalies += report.anomalies.len();
        Ok(())
    }
}
