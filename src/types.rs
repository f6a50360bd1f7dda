// =============================================================================
// Shared types used across the Aurora synthesis engine
// =============================================================================
//
// All timestamps are event-time milliseconds since the Unix epoch.  Entities
// in this file are immutable once emitted; the only mutable per-symbol state
// lives in the components that own it (indicator windows, the sentiment
// accumulator, the model registry).
// =============================================================================

use serde::{Deserialize, Serialize};

/// Event-time timestamp in milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// A normalised price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub timestamp: Timestamp,
    pub price: f64,
    pub volume: f64,
}

/// One symbol mentioned by a news item, with its relevance in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub symbol: String,
    pub relevance: f64,
}

/// A normalised, scored news item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEvent {
    pub id: String,
    pub timestamp: Timestamp,
    pub mentions: Vec<Mention>,
    /// Polarity in [-1, 1].
    pub polarity: f64,
    pub source: String,
    /// Caller-supplied reliability of this particular item, in [0, 1].
    pub source_weight: f64,
}

/// Direction of a signal or sub-signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    /// +1.0 for long, -1.0 for short, 0.0 for flat.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
            Self::Flat => 0.0,
        }
    }

    /// Direction of a signed value; `|value| < neutral_band` is flat.
    pub fn from_value(value: f64, neutral_band: f64) -> Self {
        if !value.is_finite() || value.abs() < neutral_band || value == 0.0 {
            Self::Flat
        } else if value > 0.0 {
            Self::Long
        } else {
            Self::Short
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Self::Flat
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

/// The three upstream sources a signal is synthesised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Indicator,
    Forecast,
    Sentiment,
}

impl SourceKind {
    /// Fixed evaluation order. Summation always follows this order so that
    /// synthesis is reproducible bit for bit.
    pub const ALL: [SourceKind; 3] = [Self::Indicator, Self::Forecast, Self::Sentiment];
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Indicator => write!(f, "indicator"),
            Self::Forecast => write!(f, "forecast"),
            Self::Sentiment => write!(f, "sentiment"),
        }
    }
}

/// Normalise a ticker: trim and upper-case.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_from_value_respects_band() {
        assert_eq!(Direction::from_value(0.3, 0.05), Direction::Long);
        assert_eq!(Direction::from_value(-0.3, 0.05), Direction::Short);
        assert_eq!(Direction::from_value(0.01, 0.05), Direction::Flat);
        assert_eq!(Direction::from_value(f64::NAN, 0.05), Direction::Flat);
        assert_eq!(Direction::from_value(0.0, 0.0), Direction::Flat);
    }

    #[test]
    fn direction_serialises_lowercase() {
        let json = serde_json::to_string(&Direction::Long).unwrap();
        assert_eq!(json, "\"long\"");
    }

    #[test]
    fn symbol_normalisation() {
        assert_eq!(normalize_symbol("  aapl "), "AAPL");
    }
}
