mod bot;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

use confluence_trader::config::Config;

use crate::bot::ConfluenceBot;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env().context("loading configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .init();

    if !cfg.paper_trade {
        bail!("PAPER_TRADE=false needs a broker execution gateway, and none is configured");
    }

    let mut bot = ConfluenceBot::new(cfg)?;
    bot.run().await?;

    Ok(())
}
