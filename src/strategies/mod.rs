pub mod decision;
pub mod planner;

pub use decision::{BlockReason, DecisionEngine, DecisionOutcome, RegimeContext};
pub use planner::{OrderPlanner, SizingContext};
