// =============================================================================
// Polarity Scorer -- headline text → polarity in [-1, 1]
// =============================================================================
//
// Feeds normally deliver a polarity with each news item. When only text is
// available the normalizer asks a `PolarityScorer`. The bundled scorer is a
// small finance lexicon: +1 per bullish word, -1 per bearish word, averaged
// over the words that matched.

/// Anything that can score free text.
pub trait PolarityScorer: Send + Sync {
    /// Polarity in [-1, 1], or `None` when the text carries no signal.
    fn score(&self, text: &str) -> Option<f64>;
}

const POSITIVE_WORDS: &[&str] = &[
    "growth", "rise", "rises", "rising", "rally", "increase", "gain", "gains", "profit",
    "success", "good", "positive", "best", "upward", "bullish", "buy", "upgrade", "beat",
    "beats", "recovery", "boom", "breakthrough", "win", "record", "surge", "strong",
    "outperform", "agreement", "deal",
];

const NEGATIVE_WORDS: &[&str] = &[
    "crisis", "crash", "drop", "drops", "fall", "falls", "decline", "decrease", "loss",
    "losses", "fail", "bad", "negative", "worst", "downward", "bearish", "sell", "dump",
    "collapse", "risk", "danger", "threat", "downgrade", "miss", "misses", "weak", "lawsuit",
    "investigation", "inflation", "recession", "plunge",
];

/// Lexicon scorer for unscored headlines.
#[derive(Debug, Clone, Default)]
pub struct KeywordScorer;

impl KeywordScorer {
    pub fn new() -> Self {
        Self
    }
}

impl PolarityScorer for KeywordScorer {
    fn score(&self, text: &str) -> Option<f64> {
        let mut total = 0.0;
        let mut matched = 0usize;

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            if POSITIVE_WORDS.contains(&word.as_str()) {
                total += 1.0;
                matched += 1;
            } else if NEGATIVE_WORDS.contains(&word.as_str()) {
                total -= 1.0;
                matched += 1;
            }
        }

        if matched == 0 {
            return None;
        }
        Some((total / matched as f64).clamp(-1.0, 1.0))
    }
}
