pub mod feed;
pub mod normalizer;
pub mod price_history;

pub use feed::{FeedLine, FeedSource};
pub use normalizer::{parse_raw_line, DataNormalizer, NoOpReason, Normalized, RawEvent};
pub use price_history::{PriceHistory, PricePoint};
