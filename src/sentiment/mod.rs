// =============================================================================
// Sentiment Module
// =============================================================================
//
// News polarity → per-symbol decayed sentiment. `scorer` turns raw headline
// text into a polarity when a feed delivers it unscored; `aggregator` keeps
// the exponentially decayed running sums per symbol.

pub mod aggregator;
pub mod scorer;

pub use aggregator::{SentimentAccumulator, SentimentAggregator, SentimentScore};
pub use scorer::{KeywordScorer, PolarityScorer};
