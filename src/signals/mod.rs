// =============================================================================
// Signals Module
// =============================================================================
//
// Signal synthesis pipeline:
// - Indicator rules (readings → directional votes)
// - Staleness discount (half-life past a per-source max age)
// - Confidence-weighted fusion of indicator, forecast and sentiment

pub mod rules;
pub mod staleness;
pub mod synthesizer;

pub use rules::{default_rules, IndicatorRule, RuleKind};
pub use staleness::staleness_discount;
pub use synthesizer::{
    combine, Factor, Signal, SignalSynthesizer, SourceReading, SubSignal, SynthesisInputs,
};
