pub mod candle;
pub mod direction;
pub mod order;
pub mod timeframe;

pub use candle::{Candle, CandleSeries};
pub use direction::*;
pub use order::{OrderSpec, Quote, TakeProfitLevel};
pub use timeframe::{Timeframe, TimeframeClass};
