pub mod engine;
pub mod lifecycle;
pub mod position;
pub mod reentry;
pub mod risk;
pub mod stats;

pub use engine::{EntryOutcome, PassReport, SignalBundle, TradingEngine};
pub use lifecycle::{LifecycleAction, LifecycleManager};
pub use risk::{GateStatus, HaltReason, RiskGovernor};
pub use stats::{ClosedTrade, TradingStats};
