// =============================================================================
// Forecast Module
// =============================================================================
//
// `model` holds the log-linear trend fit and its immutable snapshot type;
// `registry` versions the snapshots per symbol and stores the latest
// forecast made with each.

pub mod model;
pub mod registry;

pub use model::{fit_trend, Forecast, ModelSnapshot, TrendFit};
pub use registry::ForecastModel;
