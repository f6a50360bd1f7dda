// =============================================================================
// Indicator Rules -- turn indicator readings into directional votes
// =============================================================================
//
// Each rule reads one (or two, for crossovers) named indicators from the
// latest snapshot and votes in [-1, +1]:
//
//   momentum       tanh(value / scale)              e.g. ROC in percent
//   oscillator     +1 at/below lower, -1 at/above upper, 0 between (RSI)
//   band_breakout  clamp(2·%B - 1)                  Bollinger %B
//   crossover      tanh((value / reference - 1) / scale)   fast vs slow EMA
//   histogram      sign(value)                      MACD histogram
//
// A rule whose indicators are not ready abstains.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::indicators::{IndicatorSnapshot, IndicatorSpec};

/// How a rule maps readings to a vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleKind {
    Momentum { scale: f64 },
    Oscillator { lower: f64, upper: f64 },
    BandBreakout,
    Crossover { reference: String, scale: f64 },
    Histogram,
}

/// A weighted vote over one indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRule {
    pub indicator: String,
    pub weight: f64,
    #[serde(flatten)]
    pub kind: RuleKind,
}

impl IndicatorRule {
    /// Check weights, parameters and indicator references.
    pub fn validate(
        &self,
        idx: usize,
        indicators: &BTreeMap<String, IndicatorSpec>,
    ) -> Result<(), ConfigError> {
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(ConfigError::InvalidWeight {
                name: format!("indicator_rules[{idx}]"),
                value: self.weight,
            });
        }
        let unknown = |name: &str| ConfigError::UnknownIndicator {
            rule: idx,
            indicator: name.to_string(),
        };
        if !indicators.contains_key(&self.indicator) {
            return Err(unknown(&self.indicator));
        }
        let bad = |reason: &str| ConfigError::InvalidValue {
            field: format!("indicator_rules[{idx}]"),
            reason: reason.to_string(),
        };
        match &self.kind {
            RuleKind::Momentum { scale } if !(scale.is_finite() && *scale > 0.0) => {
                Err(bad("scale must be positive"))
            }
            RuleKind::Oscillator { lower, upper } if !(lower < upper) => {
                Err(bad("lower must be below upper"))
            }
            RuleKind::Crossover { reference, scale } => {
                if !indicators.contains_key(reference) {
                    return Err(unknown(reference));
                }
                if !(scale.is_finite() && *scale > 0.0) {
                    return Err(bad("scale must be positive"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Vote in [-1, 1], or `None` if a required reading is not ready.
    pub fn vote(&self, snapshot: &IndicatorSnapshot) -> Option<f64> {
        let value = snapshot.value(&self.indicator)?;
        let vote = match &self.kind {
            RuleKind::Momentum { scale } => (value / scale).tanh(),
            RuleKind::Oscillator { lower, upper } => {
                if value >= *upper {
                    -1.0
                } else if value <= *lower {
                    1.0
                } else {
                    0.0
                }
            }
            RuleKind::BandBreakout => (2.0 * value - 1.0).clamp(-1.0, 1.0),
            RuleKind::Crossover { reference, scale } => {
                let base = snapshot.value(reference)?;
                if base == 0.0 {
                    return None;
                }
                ((value / base - 1.0) / scale).tanh()
            }
            RuleKind::Histogram => {
                if value > 0.0 {
                    1.0
                } else if value < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
        };
        vote.is_finite().then_some(vote)
    }
}

/// Default rule set over `default_indicators()`.
pub fn default_rules() -> Vec<IndicatorRule> {
    vec![
        IndicatorRule {
            indicator: "roc_10".into(),
            weight: 1.0,
            kind: RuleKind::Momentum { scale: 2.0 },
        },
        IndicatorRule {
            indicator: "rsi_14".into(),
            weight: 1.0,
            kind: RuleKind::Oscillator {
                lower: 30.0,
                upper: 70.0,
            },
        },
        IndicatorRule {
            indicator: "bb_20".into(),
            weight: 0.5,
            kind: RuleKind::BandBreakout,
        },
        IndicatorRule {
            indicator: "ema_12".into(),
            weight: 1.0,
            kind: RuleKind::Crossover {
                reference: "ema_26".into(),
                scale: 0.005,
            },
        },
        IndicatorRule {
            indicator: "macd".into(),
            weight: 0.5,
            kind: RuleKind::Histogram,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{default_indicators, IndicatorReading};

    fn snapshot(values: &[(&str, f64)]) -> IndicatorSnapshot {
        IndicatorSnapshot {
            symbol: "AAPL".into(),
            timestamp: 1,
            price: 100.0,
            sample_count: 100,
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), IndicatorReading::Ready { value: *v }))
                .collect(),
        }
    }

    #[test]
    fn default_rules_validate_against_default_indicators() {
        let indicators = default_indicators();
        for (i, rule) in default_rules().iter().enumerate() {
            rule.validate(i, &indicators).unwrap();
        }
    }

    #[test]
    fn oscillator_votes_against_extremes() {
        let rule = &default_rules()[1];
        assert_eq!(rule.vote(&snapshot(&[("rsi_14", 75.0)])), Some(-1.0));
        assert_eq!(rule.vote(&snapshot(&[("rsi_14", 25.0)])), Some(1.0));
        assert_eq!(rule.vote(&snapshot(&[("rsi_14", 50.0)])), Some(0.0));
    }

    #[test]
    fn crossover_needs_both_readings() {
        let rule = &default_rules()[3];
        assert!(rule.vote(&snapshot(&[("ema_12", 101.0)])).is_none());
        let v = rule.vote(&snapshot(&[("ema_12", 101.0), ("ema_26", 100.0)])).unwrap();
        assert!((v - 2.0_f64.tanh()).abs() < 1e-12);
    }

    #[test]
    fn insufficient_reading_abstains() {
        let mut snap = snapshot(&[]);
        snap.values.insert(
            "roc_10".into(),
            IndicatorReading::Insufficient { have: 3, need: 11 },
        );
        assert!(default_rules()[0].vote(&snap).is_none());
    }

    #[test]
    fn rule_serde_is_flat_and_tagged() {
        let json = r#"{"indicator":"rsi_14","weight":1.0,"rule":"oscillator","lower":20.0,"upper":80.0}"#;
        let rule: IndicatorRule = serde_json::from_str(json).unwrap();
        assert_eq!(
            rule.kind,
            RuleKind::Oscillator {
                lower: 20.0,
                upper: 80.0
            }
        );
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let indicators = default_indicators();
        let bad_ref = IndicatorRule {
            indicator: "ema_12".into(),
            weight: 1.0,
            kind: RuleKind::Crossover {
                reference: "ema_200".into(),
                scale: 0.01,
            },
        };
        assert!(matches!(
            bad_ref.validate(0, &indicators),
            Err(ConfigError::UnknownIndicator { indicator, .. }) if indicator == "ema_200"
        ));
        let inverted = IndicatorRule {
            indicator: "rsi_14".into(),
            weight: 1.0,
            kind: RuleKind::Oscillator {
                lower: 80.0,
                upper: 20.0,
            },
        };
        assert!(inverted.validate(0, &indicators).is_err());
    }
}
