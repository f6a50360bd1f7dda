// =============================================================================
// Signal Synthesizer -- confidence-weighted fusion of the three sources
// =============================================================================
//
// Each source (indicators, forecast, sentiment) is first reduced to a
// sub-signal: a direction, a strength in [0, 1] and the source's own
// confidence. Writing v = sign · strength:
//
//   w_i        = base_i · staleness(age_i) · conf_i
//   net        = Σ w_i · v_i / Σ base_i
//   agreement  = |Σ u_i · v_i| / Σ u_i · |v_i|      u_i = base_i · conf_i
//   quality    = Σ w_i / Σ base_i
//   confidence = agreement · quality
//
// Agreement ignores staleness so that an input going stale can only lower
// confidence (through quality), never raise it by muting a dissenter.
// Summation always follows `SourceKind::ALL`; the result is a pure function
// of its inputs.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::forecast::Forecast;
use crate::indicators::IndicatorSnapshot;
use crate::runtime_config::SynthesisConfig;
use crate::sentiment::SentimentScore;
use crate::signals::rules::IndicatorRule;
use crate::signals::staleness::{is_fresh, staleness_discount};
use crate::types::{Direction, SourceKind, Timestamp};

// =============================================================================
// Sub-signals
// =============================================================================

/// One source reduced to a directional vote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubSignal {
    pub direction: Direction,
    /// Magnitude in [0, 1].
    pub strength: f64,
    /// The source's own confidence in [0, 1].
    pub confidence: f64,
}

impl SubSignal {
    /// Build from a signed value; magnitudes under `neutral_band` read as flat.
    pub fn from_value(value: f64, confidence: f64, neutral_band: f64) -> Self {
        let strength = if value.is_finite() { value.abs().min(1.0) } else { 0.0 };
        Self {
            direction: Direction::from_value(value, neutral_band),
            strength,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Signed vote `sign · strength`.
    pub fn value(&self) -> f64 {
        self.direction.sign() * self.strength
    }
}

/// A sub-signal together with how old its underlying data is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceReading {
    pub signal: SubSignal,
    pub age_ms: i64,
    /// Produced by a model version that has since been replaced.
    pub superseded: bool,
}

/// Weighted mean vote over the indicator rules.
///
/// Confidence is the share of rule weight whose indicators were ready.
/// Returns `None` when no rule could vote.
pub fn indicator_sub_signal(
    snapshot: &IndicatorSnapshot,
    rules: &[IndicatorRule],
    neutral_band: f64,
) -> Option<SubSignal> {
    let mut total_weight = 0.0;
    let mut ready_weight = 0.0;
    let mut weighted_vote = 0.0;

    for rule in rules {
        total_weight += rule.weight;
        if let Some(vote) = rule.vote(snapshot) {
            ready_weight += rule.weight;
            weighted_vote += rule.weight * vote;
        }
    }

    if ready_weight <= 0.0 || total_weight <= 0.0 {
        return None;
    }
    Some(SubSignal::from_value(
        weighted_vote / ready_weight,
        ready_weight / total_weight,
        neutral_band,
    ))
}

/// Expected return scaled by the interval: a move the size of the interval
/// half-width maps to tanh(1) ≈ 0.76.
pub fn forecast_sub_signal(forecast: &Forecast, neutral_band: f64) -> SubSignal {
    let r = forecast.expected_return();
    let half = forecast.half_width_return();
    let strength = if half > 0.0 {
        (r.abs() / half).tanh()
    } else if r != 0.0 {
        1.0
    } else {
        0.0
    };
    SubSignal::from_value(r.signum() * strength, forecast.confidence, neutral_band)
}

pub fn sentiment_sub_signal(score: &SentimentScore, neutral_band: f64) -> SubSignal {
    SubSignal::from_value(score.score, score.confidence, neutral_band)
}

// =============================================================================
// Signal
// =============================================================================

/// How one source entered the final signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub source: SourceKind,
    pub available: bool,
    pub direction: Direction,
    pub strength: f64,
    pub source_confidence: f64,
    pub base_weight: f64,
    pub age_ms: Option<i64>,
    pub superseded: bool,
    /// 0 when the source is missing.
    pub staleness_discount: f64,
    pub effective_weight: f64,
    /// `effective_weight · v / Σ base`; the factors sum to `net_score`.
    pub contribution: f64,
}

/// A synthesised trading signal with its full explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub strength: f64,
    pub confidence: f64,
    pub net_score: f64,
    pub agreement: f64,
    /// No source was fresh; direction forced flat and confidence capped.
    pub degraded: bool,
    pub factors: Vec<Factor>,
}

impl Signal {
    pub fn factor(&self, source: SourceKind) -> Option<&Factor> {
        self.factors.iter().find(|f| f.source == source)
    }
}

/// Everything the synthesizer reads for one symbol at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisInputs {
    pub symbol: String,
    pub timestamp: Timestamp,
    pub indicators: Option<IndicatorSnapshot>,
    pub forecast: Option<Forecast>,
    /// Set when `forecast` came from a replaced model version.
    pub forecast_superseded: bool,
    pub sentiment: Option<SentimentScore>,
}

// =============================================================================
// SignalSynthesizer
// =============================================================================

/// Stateless fusion of sub-signals under a fixed configuration.
#[derive(Debug, Clone)]
pub struct SignalSynthesizer {
    config: SynthesisConfig,
    rules: Vec<IndicatorRule>,
}

impl SignalSynthesizer {
    pub fn new(config: SynthesisConfig, rules: Vec<IndicatorRule>) -> Self {
        Self { config, rules }
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    /// Reduce the raw inputs to sub-signals with ages, then combine.
    pub fn synthesize(&self, inputs: &SynthesisInputs) -> Signal {
        let band = self.config.neutral_band;
        let ts = inputs.timestamp;

        let indicator = inputs.indicators.as_ref().and_then(|snap| {
            indicator_sub_signal(snap, &self.rules, band).map(|signal| SourceReading {
                signal,
                age_ms: ts - snap.timestamp,
                superseded: false,
            })
        });
        let forecast = inputs.forecast.as_ref().map(|f| SourceReading {
            signal: forecast_sub_signal(f, band),
            age_ms: ts - f.as_of,
            superseded: inputs.forecast_superseded,
        });
        let sentiment = inputs.sentiment.as_ref().map(|s| SourceReading {
            signal: sentiment_sub_signal(s, band),
            age_ms: ts - s.last_update,
            superseded: false,
        });

        combine(&inputs.symbol, ts, [indicator, forecast, sentiment], &self.config)
    }
}

/// Fuse per-source readings (in `SourceKind::ALL` order) into a signal.
pub fn combine(
    symbol: &str,
    timestamp: Timestamp,
    readings: [Option<SourceReading>; 3],
    config: &SynthesisConfig,
) -> Signal {
    let mut factors = Vec::with_capacity(3);

    let mut base_total = 0.0;
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut agree_signed = 0.0;
    let mut agree_abs = 0.0;
    let mut any_fresh = false;

    for (kind, reading) in SourceKind::ALL.into_iter().zip(readings) {
        let base = config.base_weights.get(kind);
        let max_age = config.max_age_ms.get(kind);
        base_total += base;

        let Some(reading) = reading else {
            factors.push(Factor {
                source: kind,
                available: false,
                direction: Direction::Flat,
                strength: 0.0,
                source_confidence: 0.0,
                base_weight: base,
                age_ms: None,
                superseded: false,
                staleness_discount: 0.0,
                effective_weight: 0.0,
                contribution: 0.0,
            });
            continue;
        };

        let age = reading.age_ms.max(0);
        // A superseded forecast counts at least one max-age past fresh.
        let effective_age = if reading.superseded {
            age.max(max_age.saturating_mul(2))
        } else {
            age
        };
        any_fresh |= is_fresh(effective_age, max_age);

        let sub = reading.signal;
        let v = sub.value();
        let discount = staleness_discount(effective_age, max_age);
        let w = base * discount * sub.confidence;
        let u = base * sub.confidence;

        weighted_sum += w * v;
        weight_total += w;
        agree_signed += u * v;
        agree_abs += u * v.abs();

        factors.push(Factor {
            source: kind,
            available: true,
            direction: sub.direction,
            strength: sub.strength,
            source_confidence: sub.confidence,
            base_weight: base,
            age_ms: Some(age),
            superseded: reading.superseded,
            staleness_discount: discount,
            effective_weight: w,
            contribution: 0.0,
        });
    }

    if base_total > 0.0 {
        for factor in factors.iter_mut().filter(|f| f.available) {
            let v = factor.direction.sign() * factor.strength;
            factor.contribution = factor.effective_weight * v / base_total;
        }
    }

    let net = if base_total > 0.0 { weighted_sum / base_total } else { 0.0 };
    // Unanimous abstention is agreement.
    let agreement = if agree_abs > 0.0 { agree_signed.abs() / agree_abs } else { 1.0 };
    let quality = if base_total > 0.0 { weight_total / base_total } else { 0.0 };
    let mut confidence = (agreement * quality).clamp(0.0, 1.0);

    let degraded = !any_fresh;
    let direction = if degraded
        || net.abs() < config.flat_threshold
        || agreement < config.conflict_threshold
    {
        Direction::Flat
    } else {
        Direction::from_value(net, 0.0)
    };
    if degraded {
        confidence = confidence.min(config.confidence_floor);
    }

    Signal {
        symbol: symbol.to_string(),
        timestamp,
        direction,
        strength: net.abs().min(1.0),
        confidence,
        net_score: net,
        agreement,
        degraded,
        factors,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorReading;
    use crate::signals::rules::default_rules;

    const MIN: i64 = 60_000;

    fn cfg() -> SynthesisConfig {
        SynthesisConfig::default()
    }

    fn reading(direction: Direction, strength: f64, age_ms: i64) -> Option<SourceReading> {
        Some(SourceReading {
            signal: SubSignal {
                direction,
                strength,
                confidence: 1.0,
            },
            age_ms,
            superseded: false,
        })
    }

    #[test]
    fn mixed_sources_with_stale_dissent_go_long_with_moderate_confidence() {
        let c = cfg();
        let sentiment_age = 2 * c.max_age_ms.sentiment;
        let s = combine(
            "AAPL",
            1_000,
            [
                reading(Direction::Long, 0.8, 0),
                reading(Direction::Flat, 0.1, 0),
                reading(Direction::Short, 0.6, sentiment_age),
            ],
            &c,
        );
        assert_eq!(s.direction, Direction::Long);
        assert!(!s.degraded);
        // net = 0.32 - 0.2·0.5·0.6
        assert!((s.net_score - 0.26).abs() < 1e-12);
        // agreement 0.2 / 0.44, quality 0.9
        assert!((s.confidence - 0.9 * 0.2 / 0.44).abs() < 1e-12);
        assert!(s.confidence > 0.3 && s.confidence < 0.6);

        let sentiment = s.factor(SourceKind::Sentiment).unwrap();
        assert!((sentiment.staleness_discount - 0.5).abs() < 1e-12);
        let sum: f64 = s.factors.iter().map(|f| f.contribution).sum();
        assert!((sum - s.net_score).abs() < 1e-12);
    }

    #[test]
    fn all_sources_missing_is_flat_at_the_floor() {
        let c = cfg();
        let s = combine("AAPL", 1_000, [None, None, None], &c);
        assert_eq!(s.direction, Direction::Flat);
        assert!(s.degraded);
        assert!(s.confidence <= c.confidence_floor);
        assert!(s.factors.iter().all(|f| !f.available));
    }

    #[test]
    fn all_sources_beyond_max_age_are_degraded() {
        let c = cfg();
        let s = combine(
            "AAPL",
            1_000,
            [
                reading(Direction::Long, 1.0, 3 * c.max_age_ms.indicator),
                reading(Direction::Long, 1.0, 3 * c.max_age_ms.forecast),
                reading(Direction::Long, 1.0, 3 * c.max_age_ms.sentiment),
            ],
            &c,
        );
        assert!(s.degraded);
        assert_eq!(s.direction, Direction::Flat);
        assert!(s.confidence <= c.confidence_floor);
    }

    #[test]
    fn confidence_never_rises_with_staleness() {
        let c = cfg();
        for stale in 0..3 {
            let mut prev = f64::INFINITY;
            for step in 0..40 {
                let age = step * c.max_age_ms.get(SourceKind::ALL[stale]) / 4;
                let mut readings = [
                    reading(Direction::Long, 0.7, 0),
                    reading(Direction::Short, 0.3, 0),
                    reading(Direction::Long, 0.5, 0),
                ];
                if let Some(r) = readings[stale].as_mut() {
                    r.age_ms = age;
                }
                let s = combine("AAPL", 0, readings, &c);
                assert!(s.confidence <= prev + 1e-15, "source {stale} step {step}");
                prev = s.confidence;
            }
        }
    }

    #[test]
    fn confidence_never_rises_with_disagreement() {
        let c = cfg();
        let dirs = [
            [Direction::Long, Direction::Long, Direction::Long],
            [Direction::Long, Direction::Long, Direction::Short],
            [Direction::Long, Direction::Short, Direction::Short],
        ];
        let mut prev = f64::INFINITY;
        for d in dirs {
            let s = combine(
                "AAPL",
                0,
                [
                    reading(d[0], 0.5, 0),
                    reading(d[1], 0.5, 0),
                    reading(d[2], 0.5, 0),
                ],
                &c,
            );
            assert!(s.confidence <= prev);
            prev = s.confidence;
        }
    }

    #[test]
    fn balanced_conflict_is_flat() {
        let s = combine(
            "AAPL",
            0,
            [
                reading(Direction::Long, 0.9, 0),
                reading(Direction::Short, 0.9, 0),
                None,
            ],
            &cfg(),
        );
        assert_eq!(s.direction, Direction::Flat);
        assert!(s.agreement.abs() < 1e-12);
        assert!(s.confidence.abs() < 1e-12);
    }

    #[test]
    fn superseded_forecast_is_discounted() {
        let c = cfg();
        let mut fresh = [None, reading(Direction::Long, 0.8, 0), None];
        let a = combine("AAPL", 0, fresh, &c);
        if let Some(r) = fresh[1].as_mut() {
            r.superseded = true;
        }
        let b = combine("AAPL", 0, fresh, &c);
        assert!(b.confidence < a.confidence);
        assert!(b.degraded);
    }

    #[test]
    fn synthesis_is_deterministic() {
        let synth = SignalSynthesizer::new(cfg(), default_rules());
        let mut values = std::collections::BTreeMap::new();
        values.insert("roc_10".to_string(), IndicatorReading::Ready { value: 1.3 });
        values.insert("rsi_14".to_string(), IndicatorReading::Ready { value: 64.0 });
        values.insert("macd".to_string(), IndicatorReading::Ready { value: 0.2 });
        let inputs = SynthesisInputs {
            symbol: "AAPL".into(),
            timestamp: 10 * MIN,
            indicators: Some(IndicatorSnapshot {
                symbol: "AAPL".into(),
                timestamp: 9 * MIN,
                price: 190.0,
                sample_count: 40,
                values,
            }),
            forecast: Some(Forecast {
                symbol: "AAPL".into(),
                as_of: 9 * MIN,
                horizon_ms: 60 * MIN,
                point: 191.0,
                lower: 188.0,
                upper: 194.0,
                confidence: 0.6,
                model_version: 3,
                base_price: 190.0,
            }),
            forecast_superseded: false,
            sentiment: Some(SentimentScore {
                symbol: "AAPL".into(),
                timestamp: 10 * MIN,
                last_update: 2 * MIN,
                score: 0.3,
                sample_count: 4,
                effective_samples: 3.5,
                confidence: 0.54,
            }),
        };
        let a = synth.synthesize(&inputs);
        let b = synth.synthesize(&inputs);
        assert_eq!(a, b);
        assert_eq!(a.net_score.to_bits(), b.net_score.to_bits());
        assert_eq!(a.direction, Direction::Long);
        // bb_20 and the EMA crossover were not ready: 2.5 of 4.0 rule weight.
        let ind = a.factor(SourceKind::Indicator).unwrap();
        assert!((ind.source_confidence - 2.5 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn indicator_without_ready_rules_is_missing() {
        let snap = IndicatorSnapshot {
            symbol: "AAPL".into(),
            timestamp: 0,
            price: 1.0,
            sample_count: 1,
            values: Default::default(),
        };
        assert!(indicator_sub_signal(&snap, &default_rules(), 0.05).is_none());
    }

    #[test]
    fn forecast_strength_scales_with_interval() {
        let f = Forecast {
            symbol: "AAPL".into(),
            as_of: 0,
            horizon_ms: 1,
            point: 101.0,
            lower: 100.0,
            upper: 102.0,
            confidence: 0.8,
            model_version: 1,
            base_price: 100.0,
        };
        let sub = forecast_sub_signal(&f, 0.05);
        assert_eq!(sub.direction, Direction::Long);
        assert!((sub.strength - 1.0_f64.tanh()).abs() < 1e-9);
        assert!((sub.confidence - 0.8).abs() < 1e-12);
    }
}
