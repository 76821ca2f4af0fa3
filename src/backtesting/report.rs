use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::Config;
use crate::trading::stats::{ClosedTrade, PatternStats, TradingStats};

/// Engine activity tallied over a run.
#[derive(Debug, Clone, Default)]
pub struct RunCounters {
    pub bars: usize,
    pub bars_with_pattern: usize,
    pub enter_decisions: usize,
    pub waits: usize,
    pub entries: usize,
    pub reentries: usize,
    pub rejections: usize,
    pub anomalies: usize,
    pub blocked: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct BacktestReport {
    // Period
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: f64,
    pub profile: String,

    // Performance
    pub initial_balance: f64,
    pub final_balance: f64,
    pub total_pnl: f64,
    pub total_return_pct: f64,

    // Trades
    pub stats: TradingStats,
    pub avg_trade: f64,
    pub pyramid_trades: usize,

    // Risk
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,

    pub counters: RunCounters,

    // Equity curve
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
}

impl BacktestReport {
    #[allow(clippy::too_many_arguments)]
    pub fn from_run(
        history: &[ClosedTrade],
        cfg: &Config,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        final_balance: f64,
        equity_curve: Vec<(DateTime<Utc>, f64)>,
        max_drawdown: f64,
        max_drawdown_pct: f64,
        counters: RunCounters,
    ) -> Self {
        let initial = cfg.initial_balance;
        let total_pnl = final_balance - initial;
        let days = (end - start).num_hours() as f64 / 24.0;
        let stats = TradingStats::from_trades(history);

        BacktestReport {
            start,
            end,
            days,
            profile: cfg.profile.name.clone(),
            initial_balance: initial,
            final_balance,
            total_pnl,
            total_return_pct: if initial > 0.0 { total_pnl / initial * 100.0 } else { 0.0 },
            avg_trade: if history.is_empty() {
                0.0
            } else {
                total_pnl / history.len() as f64
            },
            pyramid_trades: history.iter().filter(|t| t.pyramid_level > 0).count(),
            stats,
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio: compute_sharpe(&equity_curve),
            counters,
            equity_curve,
        }
    }

    /// Entries placed per bar that carried a pattern, in percent.
    pub fn conversion_pct(&self) -> f64 {
        if self.counters.bars_with_pattern > 0 {
            self.counters.entries as f64 / self.counters.bars_with_pattern as f64 * 100.0
        } else {
            0.0
        }
    }

    pub fn print_summary(&self) {
        let s = &self.stats;
        println!("\n{}", "=".repeat(70));
        println!("  BACKTEST REPORT ({})", self.profile);
        println!("{}", "=".repeat(70));
        println!(
            "  Period:      {} to {} ({:.0} days)",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d"),
            self.days
        );
        println!();
        println!("  PERFORMANCE");
        println!("  ───────────────────────────────────");
        println!("  Initial:     ${:.2}", self.initial_balance);
        println!("  Final:       ${:.2}", self.final_balance);
        println!("  PnL:         ${:+.2}", self.total_pnl);
        println!("  Return:      {:+.1}%", self.total_return_pct);
        println!();
        println!("  TRADES");
        println!("  ───────────────────────────────────");
        println!("  Total:       {} ({} pyramid adds)", s.total_trades, self.pyramid_trades);
        println!("  Win/Loss:    {} / {}", s.wins, s.losses);
        println!("  Win Rate:    {:.1}%", s.win_rate);
        println!("  Avg Win:     ${:+.2}", s.avg_win);
        println!("  Avg Loss:    ${:+.2}", s.avg_loss);
        println!("  Best:        ${:+.2}", s.best_trade);
        println!("  Worst:       ${:+.2}", s.worst_trade);
        println!("  Avg Trade:   ${:+.2}", self.avg_trade);
        println!("  Profit Factor: {:.2}", s.profit_factor);
        println!();
        println!("  RISK");
        println!("  ───────────────────────────────────");
        println!("  Max DD:      ${:.2} ({:.1}%)", self.max_drawdown, self.max_drawdown_pct);
        println!("  Sharpe:      {:.2}", self.sharpe_ratio);
        println!();
        println!("  ENGINE");
        println!("  ───────────────────────────────────");
        println!("  Bars:        {}", self.counters.bars);
        println!("  Patterns:    {}", self.counters.bars_with_pattern);
        println!("  ENTER/WAIT:  {} / {}", self.counters.enter_decisions, self.counters.waits);
        println!(
            "  Entries:     {} ({} re-entries, {} rejected)",
            self.counters.entries, self.counters.reentries, self.counters.rejections
        );
        println!("  Conversion:  {:.1}%", self.conversion_pct());
        if self.counters.anomalies > 0 {
            println!("  Anomalies:   {}", self.counters.anomalies);
        }

        if !self.counters.blocked.is_empty() {
            println!();
            println!("  BLOCKED BY");
            println!("  ───────────────────────────────────");
            let mut blocked: Vec<_> = self.counters.blocked.iter().collect();
            blocked.sort_by(|a, b| b.1.cmp(a.1));
            for (reason, n) in blocked {
                println!("  {:>22}: {}", reason, n);
            }
        }

        if !s.by_pattern.is_empty() {
            println!();
            println!("  BY PATTERN");
            println!("  ───────────────────────────────────");
            for (pattern, ps) in sorted_by_pnl(&s.by_pattern) {
                println!(
                    "  {:>16}: {} trades | WR {:.0}% | PnL ${:+.2} | Avg ${:+.2}",
                    pattern,
                    ps.trades,
                    ps.win_rate() * 100.0,
                    ps.total_pnl,
                    ps.edge()
                );
            }
        }

        if !s.by_reason.is_empty() {
            println!();
            println!("  BY EXIT");
            println!("  ───────────────────────────────────");
            let mut reasons: Vec<_> = s.by_reason.iter().collect();
            reasons.sort_by_key(|(k, _)| k.as_str());
            for (reason, n) in reasons {
                println!("  {:>12}: {}", reason, n);
            }
        }

        println!("{}", "=".repeat(70));
    }
}

fn sorted_by_pnl(by_pattern: &HashMap<String, PatternStats>) -> Vec<(&String, &PatternStats)> {
    let mut rows: Vec<_> = by_pattern.iter().collect();
    rows.sort_by(|a, b| b.1.total_pnl.total_cmp(&a.1.total_pnl));
    rows
}

fn compute_sharpe(equity_curve: &[(DateTime<Utc>, f64)]) -> f64 {
    if equity_curve.len() < 2 {
        return 0.0;
    }

    // Compute daily returns (sample once per day)
    let mut daily_values: Vec<f64> = Vec::new();
    let mut last_day = None;
    for (ts, val) in equity_curve {
        let day = ts.date_naive();
        if last_day != Some(day) {
            daily_values.push(*val);
            last_day = Some(day);
        }
    }

    if daily_values.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = daily_values.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        return 0.0;
    }

    // FX trades ~260 weekdays a year
    mean / std_dev * 260.0_f64.sqrt()
}
