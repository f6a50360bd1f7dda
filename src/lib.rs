// =============================================================================
// Aurora Synth -- signal synthesis engine
// =============================================================================
//
// Fuses technical indicators, a short-horizon price forecast and decayed news
// sentiment into one directional signal per symbol, with an explicit
// confidence. See `engine` for how the components are wired.
// =============================================================================

pub mod api;
pub mod arena;
pub mod engine;
pub mod error;
pub mod forecast;
pub mod indicators;
pub mod market_data;
pub mod narrative;
pub mod persistence;
pub mod runtime_config;
pub mod scheduler;
pub mod sentiment;
pub mod signals;
pub mod types;
