use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::filters::FilterId;
use crate::models::Direction;

/// Operator override, read from the dashboard's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorCommand {
    ClosePosition { id: u64 },
    CloseAll,
    PlaceMarket { direction: Direction, lots: f64 },
    SetFilter { filter: FilterId, active: bool },
    SelectProfile { name: String },
    HaltTrading,
    ResumeTrading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: String,
    #[serde(flatten)]
    pub command: OperatorCommand,
}

impl CommandEnvelope {
    pub fn new(command_id: &str, command: OperatorCommand) -> Self {
        Self {
            command_id: command_id.to_string(),
            command,
        }
    }
}

/// Command ids remembered for replay protection; the oldest are forgotten first.
pub const MAX_REMEMBERED_IDS: usize = 1024;

/// JSON-lines inbox. Each line is one [`CommandEnvelope`]; a command id is
/// handed out at most once among the last [`MAX_REMEMBERED_IDS`] ids, no
/// matter how often the file is re-read.
pub struct CommandQueue {
    path: PathBuf,
    lines_read: usize,
    consumed: HashSet<String>,
    consumed_order: VecDeque<String>,
    local: VecDeque<CommandEnvelope>,
}

impl CommandQueue {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lines_read: 0,
            consumed: HashSet::new(),
            consumed_order: VecDeque::new(),
            local: VecDeque::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_consumed(&self, command_id: &str) -> bool {
        self.consumed.contains(command_id)
    }

    /// Queue a command from inside the process.
    pub fn push(&mut self, envelope: CommandEnvelope) -> Result<(), CommandError> {
        if !self.remember(&envelope.command_id) {
            return Err(CommandError::AlreadyConsumed(envelope.command_id));
        }
        self.local.push_back(envelope);
        Ok(())
    }

    /// Every command not handed out before. A missing inbox is simply empty;
    /// malformed lines are logged and skipped.
    pub async fn drain(&mut self) -> Vec<CommandEnvelope> {
        let mut out: Vec<CommandEnvelope> = self.local.drain(..).collect();

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return out,
            Err(e) => {
                warn!("Command inbox {}: {}", self.path.display(), CommandError::Io(e));
                return out;
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        if lines.len() < self.lines_read {
            debug!("Command inbox truncated, rescanning");
            self.lines_read = 0;
        }
        for line in &lines[self.lines_read..] {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(env) => {
                    if self.remember(&env.command_id) {
                        out.push(env);
                    } else {
                        warn!("{}", CommandError::AlreadyConsumed(env.command_id));
                    }
                }
                Err(e) => warn!("Skipping command line: {}", e),
            }
        }
        self.lines_read = lines.len();
        out
    }

    /// False when the id was already handed out.
    fn remember(&mut self, command_id: &str) -> bool {
        if !self.consumed.insert(command_id.to_string()) {
            return false;
        }
        self.consumed_order.push_back(command_id.to_string());
        while self.consumed_order.len() > MAX_REMEMBERED_IDS {
            if let Some(old) = self.consumed_order.pop_front() {
                self.consumed.remove(&old);
            }
        }
        true
    }
}

pub fn parse_line(line: &str) -> Result<CommandEnvelope, CommandError> {
    Ok(serde_json::from_str(line)?)
}
