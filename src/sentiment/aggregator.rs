// =============================================================================
// Sentiment Aggregator -- half-life decayed, shrunk news sentiment per symbol
// =============================================================================
//
// Each symbol owns a `SentimentAccumulator` holding three running sums that
// are all expressed as of `last_ts`:
//
//   weighted_polarity = Σ w·p · decay(last_ts - t)
//   weight            = Σ w   · decay(last_ts - t)
//   effective_samples = Σ 1   · decay(last_ts - t)
//
// with decay(Δ) = exp(-Δ · ln2 / half_life). Advancing the clock multiplies
// all three sums by the same factor, so there is no window cliff. An event
// older than `last_ts` is added pre-decayed and never rewinds the clock.
//
// The accumulator also keeps its contributions sorted by event time. Past
// `CONTRIBUTION_LOG_CAP` the oldest are folded into a single floor entry.
// A query for an instant before `last_ts` is rebuilt from the floor plus the
// contributions at or before that instant, so news published later never
// leaks into an earlier score. Instants before the floor are unanswerable.
//
//   score      = weighted_polarity / (weight + prior_weight)
//   confidence = effective_samples / (effective_samples + prior_count)
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::arena::SymbolArena;
use crate::runtime_config::SentimentConfig;
use crate::types::{NewsEvent, Timestamp};

/// Contributions kept individually per symbol before folding into the floor.
const CONTRIBUTION_LOG_CAP: usize = 512;

/// Decayed sentiment for one symbol at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentScore {
    pub symbol: String,
    pub timestamp: Timestamp,
    /// Event time of the newest news item folded in.
    pub last_update: Timestamp,
    /// Shrunk, decayed polarity in [-1, 1].
    pub score: f64,
    /// Raw number of mentions ever accumulated.
    pub sample_count: u64,
    /// Decayed mention count.
    pub effective_samples: f64,
    pub confidence: f64,
}

/// Decayed sums expressed as of `ts`. A single mention has `samples == 1`
/// and `count == 1`; a folded floor carries many.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub ts: Timestamp,
    pub weighted_polarity: f64,
    pub weight: f64,
    pub samples: f64,
    pub count: u64,
}

impl Contribution {
    fn decayed_to(self, at: Timestamp, half_life_ms: i64) -> Self {
        let f = decay_factor(at - self.ts, half_life_ms);
        Self {
            ts: at.max(self.ts),
            weighted_polarity: self.weighted_polarity * f,
            weight: self.weight * f,
            samples: self.samples * f,
            count: self.count,
        }
    }

    fn merge(self, other: Self, half_life_ms: i64) -> Self {
        let at = self.ts.max(other.ts);
        let a = self.decayed_to(at, half_life_ms);
        let b = other.decayed_to(at, half_life_ms);
        Self {
            ts: at,
            weighted_polarity: a.weighted_polarity + b.weighted_polarity,
            weight: a.weight + b.weight,
            samples: a.samples + b.samples,
            count: a.count + b.count,
        }
    }
}

/// Running decayed sums for one symbol. Serialisable for restart recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentAccumulator {
    pub last_ts: Timestamp,
    pub weighted_polarity: f64,
    pub weight: f64,
    pub effective_samples: f64,
    pub sample_count: u64,
    /// Individual contributions, oldest event time first.
    #[serde(default)]
    pub recent: VecDeque<Contribution>,
    /// Everything folded out of `recent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<Contribution>,
}

fn decay_factor(elapsed_ms: i64, half_life_ms: i64) -> f64 {
    if elapsed_ms <= 0 {
        return 1.0;
    }
    (-(elapsed_ms as f64) * std::f64::consts::LN_2 / half_life_ms as f64).exp()
}

impl SentimentAccumulator {
    /// Fold one weighted polarity observation at `ts` into the sums.
    fn add(&mut self, ts: Timestamp, polarity: f64, weight: f64, half_life_ms: i64) {
        if self.sample_count == 0 || ts >= self.last_ts {
            let f = decay_factor(ts - self.last_ts, half_life_ms);
            if self.sample_count == 0 {
                self.last_ts = ts;
            } else {
                self.weighted_polarity *= f;
                self.weight *= f;
                self.effective_samples *= f;
                self.last_ts = ts;
            }
            self.weighted_polarity += weight * polarity;
            self.weight += weight;
            self.effective_samples += 1.0;
        } else {
            let f = decay_factor(self.last_ts - ts, half_life_ms);
            self.weighted_polarity += weight * polarity * f;
            self.weight += weight * f;
            self.effective_samples += f;
        }
        self.sample_count += 1;
        self.log(
            Contribution {
                ts,
                weighted_polarity: weight * polarity,
                weight,
                samples: 1.0,
                count: 1,
            },
            half_life_ms,
        );
    }

    fn log(&mut self, contribution: Contribution, half_life_ms: i64) {
        match self.floor {
            Some(floor) if contribution.ts <= floor.ts => {
                self.floor = Some(floor.merge(contribution, half_life_ms));
            }
            _ => {
                let at = self.recent.partition_point(|c| c.ts <= contribution.ts);
                self.recent.insert(at, contribution);
            }
        }
        while self.recent.len() > CONTRIBUTION_LOG_CAP {
            let Some(oldest) = self.recent.pop_front() else { break };
            self.floor = Some(match self.floor {
                Some(floor) => floor.merge(oldest, half_life_ms),
                None => oldest,
            });
        }
    }

    /// The running sums decayed forward to `ts` (never backwards).
    fn current_view(&self, ts: Timestamp, half_life_ms: i64) -> Contribution {
        Contribution {
            ts: self.last_ts,
            weighted_polarity: self.weighted_polarity,
            weight: self.weight,
            samples: self.effective_samples,
            count: self.sample_count,
        }
        .decayed_to(ts, half_life_ms)
    }

    /// Sums rebuilt from contributions at or before `ts`, decayed to `ts`,
    /// with the event time of the newest one. `None` when no news predates
    /// `ts` or the log no longer reaches back that far.
    fn view_as_of(&self, ts: Timestamp, half_life_ms: i64) -> Option<(Contribution, Timestamp)> {
        let logged = self.floor.map_or(0, |f| f.count) + self.recent.len() as u64;
        if logged < self.sample_count {
            return None;
        }
        if self.floor.map_or(false, |f| ts < f.ts) {
            return None;
        }
        let rebuilt = self
            .recent
            .iter()
            .take_while(|c| c.ts <= ts)
            .fold(self.floor, |acc, c| {
                Some(match acc {
                    Some(a) => a.merge(*c, half_life_ms),
                    None => *c,
                })
            })?;
        Some((rebuilt.decayed_to(ts, half_life_ms), rebuilt.ts))
    }
}

/// Per-symbol decayed sentiment.
pub struct SentimentAggregator {
    config: SentimentConfig,
    accumulators: SymbolArena<SentimentAccumulator>,
}

impl SentimentAggregator {
    pub fn new(config: SentimentConfig) -> Self {
        Self {
            config,
            accumulators: SymbolArena::new(),
        }
    }

    fn reliability(&self, source: &str) -> f64 {
        self.config
            .source_reliability
            .get(source)
            .copied()
            .unwrap_or(self.config.default_reliability)
    }

    fn to_score(&self, symbol: &str, view: Contribution, last_update: Timestamp) -> SentimentScore {
        let denom = view.weight + self.config.prior_weight;
        let score = if denom > 0.0 {
            (view.weighted_polarity / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let confidence = view.samples / (view.samples + self.config.prior_count);
        SentimentScore {
            symbol: symbol.to_string(),
            timestamp: view.ts,
            last_update,
            score,
            sample_count: view.count,
            effective_samples: view.samples,
            confidence,
        }
    }

    /// Fold a news event into every mentioned symbol. Returns the updated
    /// score per symbol in mention order.
    pub fn ingest(&self, event: &NewsEvent) -> Vec<SentimentScore> {
        let reliability = self.reliability(&event.source);
        let half_life = self.config.half_life_ms;

        event
            .mentions
            .iter()
            .map(|mention| {
                let weight = event.source_weight * reliability * mention.relevance;
                self.accumulators.with(
                    &mention.symbol,
                    SentimentAccumulator::default,
                    |acc| {
                        acc.add(event.timestamp, event.polarity, weight, half_life);
                        let view = acc.current_view(acc.last_ts, half_life);
                        let score = self.to_score(&mention.symbol, view, acc.last_ts);
                        trace!(
                            symbol = %mention.symbol,
                            id = %event.id,
                            polarity = event.polarity,
                            weight,
                            score = score.score,
                            "sentiment updated"
                        );
                        score
                    },
                )
            })
            .collect()
    }

    /// Sentiment for `symbol` as of `ts`, built only from news published at
    /// or before `ts`. Read-only.
    pub fn score_at(&self, symbol: &str, ts: Timestamp) -> Option<SentimentScore> {
        let slot = self.accumulators.get(symbol)?;
        let acc = slot.lock();
        if acc.sample_count == 0 {
            return None;
        }
        let half_life = self.config.half_life_ms;
        if ts >= acc.last_ts {
            let view = acc.current_view(ts, half_life);
            return Some(self.to_score(symbol, view, acc.last_ts));
        }
        let (view, last_update) = acc.view_as_of(ts, half_life)?;
        Some(self.to_score(symbol, view, last_update))
    }

    /// Copy of every accumulator, for persistence.
    pub fn export(&self) -> BTreeMap<String, SentimentAccumulator> {
        self.accumulators
            .symbols()
            .into_iter()
            .filter_map(|sym| {
                let acc = self.accumulators.get(&sym)?.lock().clone();
                Some((sym, acc))
            })
            .collect()
    }

    /// Replace a symbol's accumulator with a persisted one.
    pub fn restore(&self, symbol: &str, acc: SentimentAccumulator) {
        self.accumulators
            .with(symbol, SentimentAccumulator::default, |slot| *slot = acc);
    }

    pub fn symbols(&self) -> Vec<String> {
        self.accumulators.symbols()
    }
}
