//! Domain error types.
//!
//! Per-event and per-symbol failures are values, never panics: the engine
//! counts and logs them and carries on with the next event. Only
//! [`ConfigError`] is fatal, and only at startup.

use thiserror::Error;

use crate::types::Timestamp;

/// Why a raw event was rejected by the normalizer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("late event for {symbol}: timestamp {timestamp} is {lag_ms}ms behind {max_seen} (tolerance {tolerance_ms}ms)")]
    Late {
        symbol: String,
        timestamp: Timestamp,
        max_seen: Timestamp,
        lag_ms: i64,
        tolerance_ms: i64,
    },

    #[error("news event {id} carries no polarity and its text could not be scored")]
    Unscoreable { id: String },
}

impl IngestError {
    /// Short machine-readable label used for counters and the warning log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "MALFORMED",
            Self::Late { .. } => "LATE",
            Self::Unscoreable { .. } => "UNSCOREABLE",
        }
    }
}

/// Why a retrain left the previous model version in place.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrainError {
    #[error("insufficient history for {symbol}: have {have} samples, need {need}")]
    InsufficientHistory {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("degenerate history for {symbol}: {reason}")]
    Degenerate { symbol: String, reason: String },

    #[error("fit diverged for {symbol}: non-finite parameters")]
    Diverged { symbol: String },
}

/// Why a prediction could not be produced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error("no trained model for {0}")]
    NoModel(String),

    #[error("no price observed for {0}")]
    NoPrice(String),

    #[error("invalid horizon {0}ms")]
    InvalidHorizon(i64),

    #[error("prediction for {0} is not finite")]
    NonFinite(String),
}

/// Invalid configuration. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid weight for {name}: {value}")]
    InvalidWeight { name: String, value: f64 },

    #[error("all base weights are zero")]
    ZeroWeights,

    #[error("indicator rule #{rule} references unknown indicator {indicator:?}")]
    UnknownIndicator { rule: usize, indicator: String },

    #[error("indicator {name:?}: {reason}")]
    InvalidIndicator { name: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}
