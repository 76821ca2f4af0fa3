use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown trading profile: {0}")]
    UnknownProfile(String),

    #[error("invalid profile {profile}: {reason}")]
    InvalidProfile { profile: String, reason: String },

    #[error("take-profit close percentages sum to {0:.1}%, must not exceed 100%")]
    ClosePercentages(f64),
}

/// Reasons the execution boundary refuses an order or modification.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("insufficient margin: need {required:.2}, free {free:.2}")]
    InsufficientMargin { required: f64, free: f64 },

    #[error("invalid stops: {0}")]
    InvalidStops(String),

    #[error("invalid volume {0}")]
    InvalidVolume(f64),

    #[error("unknown order or position {0}")]
    UnknownOrder(u64),

    #[error("market closed")]
    MarketClosed,

    #[error("gateway error: {0}")]
    Other(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum LifecycleError {
    #[error("position registry full ({0} slots)")]
    CapacityExceeded(usize),

    #[error("position {0} is already tracked")]
    DuplicateId(u64),

    #[error("position {0} is not tracked")]
    UnknownId(u64),
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal provider timed out")]
    Timeout,

    #[error("signal provider unavailable: {0}")]
    Unavailable(String),

    #[error("malformed signal payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("signal channel I/O: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command {command_id} references unknown position {position_id}")]
    UnknownPosition { command_id: String, position_id: u64 },

    #[error("command {0} was already consumed")]
    AlreadyConsumed(String),

    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("command inbox I/O: {0}")]
    Io(#[from] std::io::Error),
}
