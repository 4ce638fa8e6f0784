//! Domain types for IntraLab

pub mod candle;
pub mod position;
pub mod signal;
pub mod timeframe;
pub mod trade;

pub use candle::{Candle, RawCandle};
pub use position::Position;
pub use signal::{Side, Signal};
pub use timeframe::{ParseTimeframeError, Timeframe};
pub use trade::{ExitReason, Trade};

/// Symbol type alias
pub type Symbol = String;
