use anyhow::{bail, Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

use confluence_trader::backtesting::{BacktestReport, BacktestRunner};
use confluence_trader::config::{Config, TradingProfile};
use confluence_trader::exchange::{load_candles, HistoricalFeed};

#[tokio::main]
async fn main() -> Result<()> {
    let mut cfg = Config::from_env().context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    // Parse CLI args or use defaults: [bars.json] [profile]
    let args: Vec<String> = std::env::args().collect();
    let path = args.get(1).cloned().unwrap_or_else(|| cfg.feed_path.clone());
    if let Some(name) = args.get(2) {
        cfg.profile = TradingProfile::preset(name)?;
    }

    let candles = load_candles(&path)?;
    if candles.len() <= cfg.decision.atr_period + 1 {
        bail!("{} holds {} bars, not enough to backtest", path, candles.len());
    }

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║          CONFLUENCE TRADER BACKTESTER                    ║");
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("║  Symbol:     {:<44}║", cfg.instrument.symbol);
    println!("║  Profile:    {:<44}║", format!("{} ({})", cfg.profile.name, cfg.profile.timeframe));
    println!("║  Bars:       {:<44}║", candles.len());
    println!("║  Balance:    {:<44}║", format!("${:.2}", cfg.initial_balance));
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    let spread = cfg.sim_spread_pips * cfg.instrument.pip_size;
    let feed = HistoricalFeed::new(&cfg.instrument.symbol, cfg.profile.timeframe, candles, cfg.data_lookback)
        .with_spread(spread);

    let mut runner = BacktestRunner::new(feed, cfg)?;
    let report = runner.run().await?;

    report.print_summary();

    std::fs::create_dir_all("data")?;
    let report_file = format!(
        "data/backtest_{}_{}_{}.txt",
        report.profile,
        report.start.format("%Y%m%d"),
        report.end.format("%Y%m%d"),
    );
    save_report_to_file(&report, &report_file)?;
    println!("\nReport saved to: {}", report_file);

    Ok(())
}

fn save_report_to_file(report: &BacktestReport, path: &str) -> Result<()> {
    use std::io::Write;

    let mut f = std::fs::File::create(path)?;
    let s = &report.stats;

    writeln!(f, "Confluence Trader Backtest Report ({})", report.profile)?;
    writeln!(f, "=====================================")?;
    writeln!(
        f,
        "Period: {} to {} ({:.0} days)",
        report.start.format("%Y-%m-%d"),
        report.end.format("%Y-%m-%d"),
        report.days
    )?;
    writeln!(f)?;
    writeln!(f, "Performance:")?;
    writeln!(f, "  Initial:  ${:.2}", report.initial_balance)?;
    writeln!(f, "  Final:    ${:.2}", report.final_balance)?;
    writeln!(f, "  PnL:      ${:+.2}", report.total_pnl)?;
    writeln!(f, "  Return:   {:+.1}%", report.total_return_pct)?;
    writeln!(f)?;
    writeln!(f, "Trades:")?;
    writeln!(f, "  Total:       {} ({} pyramid adds)", s.total_trades, report.pyramid_trades)?;
    writeln!(f, "  Win/Loss:    {} / {}", s.wins, s.losses)?;
    writeln!(f, "  Win Rate:    {:.1}%", s.win_rate)?;
    writeln!(f, "  Avg Win:     ${:+.2}", s.avg_win)?;
    writeln!(f, "  Avg Loss:    ${:+.2}", s.avg_loss)?;
    writeln!(f, "  Profit Factor: {:.2}", s.profit_factor)?;
    writeln!(f)?;
    writeln!(f, "Risk:")?;
    writeln!(f, "  Max DD:    ${:.2} ({:.1}%)", report.max_drawdown, report.max_drawdown_pct)?;
    writeln!(f, "  Sharpe:    {:.2}", report.sharpe_ratio)?;
    writeln!(f)?;
    writeln!(f, "Engine:")?;
    writeln!(f, "  Bars:        {}", report.counters.bars)?;
    writeln!(f, "  Patterns:    {}", report.counters.bars_with_pattern)?;
    writeln!(f, "  Entries:     {} ({} re-entries)", report.counters.entries, report.counters.reentries)?;
    writeln!(f, "  Conversion:  {:.1}%", report.conversion_pct())?;
    writeln!(f)?;
    writeln!(f, "By Pattern:")?;
    for (pattern, ps) in &s.by_pattern {
        writeln!(
            f,
            "  {}: {} trades | WR {:.0}% | PnL ${:+.2}",
            pattern,
            ps.trades,
            ps.win_rate() * 100.0,
            ps.total_pnl
        )?;
    }
    writeln!(f)?;
    writeln!(f, "Blocked By:")?;
    for (reason, n) in &report.counters.blocked {
        writeln!(f, "  {}: {}", reason, n)?;
    }

    Ok(())
}
