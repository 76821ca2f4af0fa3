pub mod backtesting;
pub mod config;
pub mod core;
pub mod dashboard;
pub mod error;
pub mod exchange;
pub mod filters;
pub mod models;
pub mod signals;
pub mod strategies;
#[cfg(test)]
pub mod test_helpers;
pub mod trading;
