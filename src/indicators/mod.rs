// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Each formula lives in its own file with two faces: a pure batch function
// over a slice of closes (the reference implementation) and an incremental
// state machine that consumes one price at a time in bounded time. The
// `engine` module runs the incremental machines per symbol.

pub mod bollinger;
pub mod ema;
pub mod engine;
pub mod macd;
pub mod roc;
pub mod rolling;
pub mod rsi;
pub mod sma;
pub mod volatility;
pub mod volume;

pub use engine::{default_indicators, IndicatorEngine, IndicatorReading, IndicatorSnapshot, IndicatorSpec};
