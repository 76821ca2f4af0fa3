pub mod report;
pub mod runner;

pub use report::{BacktestReport, RunCounters};
pub use runner::BacktestRunner;
