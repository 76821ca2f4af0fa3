pub mod sessions;
pub mod stop_loss;
pub mod structure;
