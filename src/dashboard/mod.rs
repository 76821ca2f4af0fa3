//! Dashboard boundary: periodic state export out, operator commands in.

pub mod commands;
pub mod export;

pub use commands::{CommandEnvelope, CommandQueue, OperatorCommand};
pub use export::{StateExporter, StateSnapshot, SCHEMA_VERSION};
