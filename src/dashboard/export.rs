use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::models::{Decision, Direction, MarketRegime, PositionState};

/// Bumped whenever a field is renamed or removed.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterState {
    pub number: usize,
    pub name: String,
    pub active: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceSummary {
    pub score: usize,
    pub active: usize,
    pub required: usize,
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub id: u64,
    pub direction: Direction,
    pub state: PositionState,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub remaining_volume: f64,
    pub pattern: String,
    pub pyramid_level: u32,
    pub reentry_attempt: u32,
    pub floating_pnl: f64,
    pub frozen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSummary {
    pub balance: f64,
    pub realized_today: f64,
    pub realized_week: f64,
    pub drawdown_pct: f64,
    pub risk_scale: f64,
    pub consecutive_losses: u32,
    pub trades_today: u32,
    pub gate: String,
}

/// Dashboard view of the engine. Read-only copy; nothing flows back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub symbol: String,
    pub profile: String,
    pub bias: Option<Direction>,
    pub regime: Option<MarketRegime>,
    pub confluence: Option<ConfluenceSummary>,
    pub filters: Vec<FilterState>,
    pub positions: Vec<PositionSummary>,
    pub risk: RiskSummary,
    pub reentry_tickets: usize,
    pub degraded: bool,
}

/// Best-effort periodic writer. Failures are logged, never returned.
pub struct StateExporter {
    path: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
}

impl StateExporter {
    pub fn new(path: impl AsRef<Path>, interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            interval,
            last_write: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn due(&self) -> bool {
        self.last_write.map_or(true, |t| t.elapsed() >= self.interval)
    }

    /// Write to a sibling temp file, then rename over the target so readers
    /// never see a half-written document.
    pub fn write(&mut self, snapshot: &StateSnapshot) -> bool {
        self.last_write = Some(Instant::now());
        match self.try_write(snapshot) {
            Ok(()) => {
                debug!("State exported to {}", self.path.display());
                true
            }
            Err(e) => {
                warn!("State export to {} failed: {:#}", self.path.display(), e);
                false
            }
        }
    }

    fn try_write(&self, snapshot: &StateSnapshot) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
