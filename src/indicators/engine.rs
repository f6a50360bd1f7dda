// =============================================================================
// Indicator Engine -- incremental per-symbol indicator state
// =============================================================================
//
// Each symbol owns one incremental state machine per configured indicator.
// `update` pushes a single price through every machine in bounded time and
// publishes the resulting snapshot to a separate read map, so readers (the
// synthesizer, the dashboard) never wait on an indicator window lock. The
// read map keeps the last `SNAPSHOT_HISTORY` snapshots per symbol so that an
// as-of query can serve the newest snapshot at or before a past instant.
//
// Warm-up is explicit: until an indicator has seen enough samples its reading
// is `Insufficient { have, need }`; a short window is never used silently.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::arena::SymbolArena;
use crate::error::ConfigError;
use crate::indicators::bollinger::BollingerState;
use crate::indicators::ema::EmaState;
use crate::indicators::macd::MacdState;
use crate::indicators::roc::RocState;
use crate::indicators::rsi::RsiState;
use crate::indicators::sma::SmaState;
use crate::indicators::volatility::VolatilityState;
use crate::indicators::volume::VolumeRatioState;
use crate::types::{MarketEvent, Timestamp};

/// Published snapshots kept per symbol for as-of lookups.
const SNAPSHOT_HISTORY: usize = 64;

fn default_num_std() -> f64 {
    2.0
}

// =============================================================================
// Configuration
// =============================================================================

/// Formula kind and window parameters of one configured indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Sma {
        window: usize,
    },
    Ema {
        window: usize,
    },
    Rsi {
        window: usize,
    },
    Roc {
        window: usize,
    },
    /// Reads %B.
    Bollinger {
        window: usize,
        #[serde(default = "default_num_std")]
        num_std: f64,
    },
    BollingerWidth {
        window: usize,
        #[serde(default = "default_num_std")]
        num_std: f64,
    },
    /// Reads the MACD histogram.
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
    },
    Volatility {
        window: usize,
    },
    /// Reads the last volume over the rolling mean volume.
    VolumeRatio {
        window: usize,
    },
}

impl IndicatorSpec {
    /// Number of prices needed before the first `Ready` reading.
    pub fn warmup(&self) -> usize {
        match *self {
            Self::Sma { window }
            | Self::Ema { window }
            | Self::Bollinger { window, .. }
            | Self::BollingerWidth { window, .. }
            | Self::VolumeRatio { window } => window,
            Self::Rsi { window } | Self::Roc { window } | Self::Volatility { window } => window + 1,
            Self::Macd { slow, signal, .. } => slow + signal - 1,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidIndicator {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        match *self {
            Self::Sma { window }
            | Self::Ema { window }
            | Self::Rsi { window }
            | Self::Roc { window }
            | Self::Volatility { window }
            | Self::VolumeRatio { window } => {
                if window == 0 {
                    return Err(invalid("window must be at least 1"));
                }
            }
            Self::Bollinger { window, num_std } | Self::BollingerWidth { window, num_std } => {
                if window < 2 {
                    return Err(invalid("window must be at least 2"));
                }
                if !num_std.is_finite() || num_std <= 0.0 {
                    return Err(invalid("num_std must be positive"));
                }
            }
            Self::Macd { fast, slow, signal } => {
                if fast == 0 || signal == 0 {
                    return Err(invalid("periods must be at least 1"));
                }
                if fast >= slow {
                    return Err(invalid("fast period must be shorter than slow period"));
                }
            }
        }
        Ok(())
    }

    fn build(&self) -> IndicatorState {
        match *self {
            Self::Sma { window } => IndicatorState::Sma(SmaState::new(window)),
            Self::Ema { window } => IndicatorState::Ema(EmaState::new(window)),
            Self::Rsi { window } => IndicatorState::Rsi(RsiState::new(window)),
            Self::Roc { window } => IndicatorState::Roc(RocState::new(window)),
            Self::Bollinger { window, num_std } => {
                IndicatorState::PercentB(BollingerState::new(window, num_std))
            }
            Self::BollingerWidth { window, num_std } => {
                IndicatorState::BandWidth(BollingerState::new(window, num_std))
            }
            Self::Macd { fast, slow, signal } => IndicatorState::Macd(MacdState::new(fast, slow, signal)),
            Self::Volatility { window } => IndicatorState::Volatility(VolatilityState::new(window)),
            Self::VolumeRatio { window } => IndicatorState::VolumeRatio(VolumeRatioState::new(window)),
        }
    }
}

/// Default indicator set.
pub fn default_indicators() -> BTreeMap<String, IndicatorSpec> {
    let mut m = BTreeMap::new();
    m.insert("sma_20".to_string(), IndicatorSpec::Sma { window: 20 });
    m.insert("ema_12".to_string(), IndicatorSpec::Ema { window: 12 });
    m.insert("ema_26".to_string(), IndicatorSpec::Ema { window: 26 });
    m.insert("rsi_14".to_string(), IndicatorSpec::Rsi { window: 14 });
    m.insert("roc_10".to_string(), IndicatorSpec::Roc { window: 10 });
    m.insert(
        "bb_20".to_string(),
        IndicatorSpec::Bollinger {
            window: 20,
            num_std: 2.0,
        },
    );
    m.insert(
        "bbw_20".to_string(),
        IndicatorSpec::BollingerWidth {
            window: 20,
            num_std: 2.0,
        },
    );
    m.insert(
        "macd".to_string(),
        IndicatorSpec::Macd {
            fast: 12,
            slow: 26,
            signal: 9,
        },
    );
    m.insert("vol_20".to_string(), IndicatorSpec::Volatility { window: 20 });
    m.insert("volume_ratio_10".to_string(), IndicatorSpec::VolumeRatio { window: 10 });
    m
}

// =============================================================================
// Readings & snapshots
// =============================================================================

/// Value of one indicator at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndicatorReading {
    Ready { value: f64 },
    Insufficient { have: usize, need: usize },
}

impl IndicatorReading {
    pub fn value(&self) -> Option<f64> {
        match *self {
            Self::Ready { value } => Some(value),
            Self::Insufficient { .. } => None,
        }
    }
}

/// All indicator readings for one symbol at one evaluation tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub timestamp: Timestamp,
    pub price: f64,
    pub sample_count: usize,
    pub values: BTreeMap<String, IndicatorReading>,
}

impl IndicatorSnapshot {
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(IndicatorReading::value)
    }
}

// =============================================================================
// Incremental state
// =============================================================================

#[derive(Debug, Clone)]
enum IndicatorState {
    Sma(SmaState),
    Ema(EmaState),
    Rsi(RsiState),
    Roc(RocState),
    PercentB(BollingerState),
    BandWidth(BollingerState),
    Macd(MacdState),
    Volatility(VolatilityState),
    VolumeRatio(VolumeRatioState),
}

impl IndicatorState {
    fn push(&mut self, price: f64, volume: f64) -> Option<f64> {
        match self {
            Self::Sma(s) => s.push(price),
            Self::Ema(s) => s.push(price),
            Self::Rsi(s) => s.push(price),
            Self::Roc(s) => s.push(price),
            Self::PercentB(s) => s.push(price).map(|bb| bb.percent_b(price)),
            Self::BandWidth(s) => s.push(price).map(|bb| bb.width),
            Self::Macd(s) => s.push(price),
            Self::Volatility(s) => s.push(price),
            Self::VolumeRatio(s) => s.push(volume),
        }
    }
}

struct SymbolIndicators {
    states: Vec<(String, usize, IndicatorState)>,
    samples: usize,
    last_timestamp: Option<Timestamp>,
}

// =============================================================================
// IndicatorEngine
// =============================================================================

pub struct IndicatorEngine {
    specs: BTreeMap<String, IndicatorSpec>,
    states: SymbolArena<SymbolIndicators>,
    /// Recent snapshots per symbol, oldest first.
    published: RwLock<HashMap<String, VecDeque<IndicatorSnapshot>>>,
}

impl IndicatorEngine {
    pub fn new(specs: BTreeMap<String, IndicatorSpec>) -> Self {
        Self {
            specs,
            states: SymbolArena::new(),
            published: RwLock::new(HashMap::new()),
        }
    }

    pub fn specs(&self) -> &BTreeMap<String, IndicatorSpec> {
        &self.specs
    }

    fn fresh_state(&self) -> SymbolIndicators {
        SymbolIndicators {
            states: self
                .specs
                .iter()
                .map(|(name, spec)| (name.clone(), spec.warmup(), spec.build()))
                .collect(),
            samples: 0,
            last_timestamp: None,
        }
    }

    /// Push one released price event and return the new snapshot.
    ///
    /// Events must arrive in strictly increasing timestamp order per symbol
    /// (the normalizer guarantees this). An out-of-order event is not applied;
    /// the current snapshot is returned unchanged.
    pub fn update(&self, event: &MarketEvent) -> IndicatorSnapshot {
        let slot = self.states.slot(&event.symbol, || self.fresh_state());
        let mut state = slot.lock();

        if let Some(last) = state.last_timestamp {
            if event.timestamp <= last {
                warn!(
                    symbol = %event.symbol,
                    timestamp = event.timestamp,
                    last,
                    "indicator update out of order -- ignored"
                );
                drop(state);
                return self.latest(&event.symbol).unwrap_or_else(|| IndicatorSnapshot {
                    symbol: event.symbol.clone(),
                    timestamp: last,
                    price: event.price,
                    sample_count: 0,
                    values: BTreeMap::new(),
                });
            }
        }

        state.samples += 1;
        state.last_timestamp = Some(event.timestamp);
        let samples = state.samples;

        let values: BTreeMap<String, IndicatorReading> = state
            .states
            .iter_mut()
            .map(|(name, need, machine)| {
                let reading = match machine.push(event.price, event.volume) {
                    Some(value) if value.is_finite() => IndicatorReading::Ready { value },
                    _ => IndicatorReading::Insufficient {
                        have: samples.min(*need),
                        need: *need,
                    },
                };
                (name.clone(), reading)
            })
            .collect();

        let snapshot = IndicatorSnapshot {
            symbol: event.symbol.clone(),
            timestamp: event.timestamp,
            price: event.price,
            sample_count: samples,
            values,
        };

        // Publish while still holding the symbol lock so the read map never
        // goes backwards in time.
        self.publish(snapshot.clone());
        trace!(symbol = %event.symbol, ts = event.timestamp, "indicator snapshot published");

        snapshot
    }

    /// Apply a batch in order. Produces the same snapshots as calling
    /// `update` once per event.
    pub fn update_batch(&self, events: &[MarketEvent]) -> Vec<IndicatorSnapshot> {
        events.iter().map(|e| self.update(e)).collect()
    }

    fn publish(&self, snapshot: IndicatorSnapshot) {
        let mut published = self.published.write();
        let ring = published.entry(snapshot.symbol.clone()).or_default();
        ring.push_back(snapshot);
        while ring.len() > SNAPSHOT_HISTORY {
            ring.pop_front();
        }
    }

    /// Latest published snapshot for `symbol`.
    pub fn latest(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        self.published.read().get(symbol)?.back().cloned()
    }

    /// Newest snapshot at or before `ts`, if still retained.
    pub fn latest_as_of(&self, symbol: &str, ts: Timestamp) -> Option<IndicatorSnapshot> {
        self.published
            .read()
            .get(symbol)?
            .iter()
            .rev()
            .find(|s| s.timestamp <= ts)
            .cloned()
    }

    /// Seed the read map from persisted state. Windows warm up again from
    /// live data; the restored snapshot is served until then and wins over a
    /// replayed one at the same timestamp.
    pub fn restore(&self, snapshot: IndicatorSnapshot) {
        let mut published = self.published.write();
        let ring = published.entry(snapshot.symbol.clone()).or_default();
        match ring.back() {
            Some(cur) if cur.timestamp > snapshot.timestamp => {}
            Some(cur) if cur.timestamp == snapshot.timestamp => {
                ring.pop_back();
                ring.push_back(snapshot);
            }
            _ => ring.push_back(snapshot),
        }
        while ring.len() > SNAPSHOT_HISTORY {
            ring.pop_front();
        }
    }

    pub fn all_latest(&self) -> Vec<IndicatorSnapshot> {
        let mut all: Vec<IndicatorSnapshot> = self
            .published
            .read()
            .values()
            .filter_map(|ring| ring.back().cloned())
            .collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{bollinger, ema, macd, roc, rsi, sma, volatility, volume};

    fn event(symbol: &str, ts: i64, price: f64) -> MarketEvent {
        MarketEvent {
            symbol: symbol.to_string(),
            timestamp: ts,
            price,
            volume: 1_000.0 + (ts as f64 * 0.29).sin() * 300.0,
        }
    }

    fn prices(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 120.0 + (i as f64 * 0.07).sin() * 8.0 + (i as f64 * 0.53).cos() * 1.5)
            .collect()
    }

    #[test]
    fn insufficient_data_is_marked_not_computed() {
        let engine = IndicatorEngine::new(default_indicators());
        let snap = engine.update(&event("AAPL", 1, 100.0));
        assert_eq!(
            snap.values["sma_20"],
            IndicatorReading::Insufficient { have: 1, need: 20 }
        );
        assert_eq!(
            snap.values["rsi_14"],
            IndicatorReading::Insufficient { have: 1, need: 15 }
        );
        assert!(snap.value("sma_20").is_none());
    }

    #[test]
    fn warmup_boundaries() {
        let mut specs = BTreeMap::new();
        specs.insert("sma".to_string(), IndicatorSpec::Sma { window: 3 });
        specs.insert("rsi".to_string(), IndicatorSpec::Rsi { window: 3 });
        let engine = IndicatorEngine::new(specs);
        let snaps = engine.update_batch(&[
            event("X", 1, 1.0),
            event("X", 2, 2.0),
            event("X", 3, 3.0),
            event("X", 4, 4.0),
        ]);
        assert!(snaps[1].value("sma").is_none());
        assert_eq!(snaps[2].value("sma"), Some(2.0));
        assert!(snaps[2].value("rsi").is_none());
        assert_eq!(snaps[3].value("rsi"), Some(100.0));
    }

    #[test]
    fn incremental_equals_full_recomputation_over_long_stream() {
        let engine = IndicatorEngine::new(default_indicators());
        let closes = prices(4_000);
        let mut last = None;
        for (i, &p) in closes.iter().enumerate() {
            last = Some(engine.update(&event("BTC", i as i64 + 1, p)));
        }
        let snap = last.unwrap();

        let expect = |name: &str, v: f64, tol: f64| {
            let got = snap.value(name).unwrap();
            assert!((got - v).abs() <= tol, "{name}: incremental {got} vs full {v}");
        };
        expect("sma_20", *sma::calculate_sma(&closes, 20).last().unwrap(), 1e-9);
        expect("ema_12", *ema::calculate_ema(&closes, 12).last().unwrap(), 0.0);
        expect("ema_26", *ema::calculate_ema(&closes, 26).last().unwrap(), 0.0);
        expect("rsi_14", *rsi::calculate_rsi(&closes, 14).last().unwrap(), 0.0);
        expect("roc_10", *roc::calculate_roc(&closes, 10).last().unwrap(), 0.0);
        expect(
            "macd",
            *macd::calculate_macd_histogram(&closes, 12, 26, 9).last().unwrap(),
            0.0,
        );
        let bb = bollinger::calculate_bollinger(&closes, 20, 2.0).unwrap();
        expect("bb_20", bb.percent_b(*closes.last().unwrap()), 1e-6);
        expect("bbw_20", bb.width, 1e-6);
        expect("vol_20", volatility::calculate_volatility(&closes, 20).unwrap(), 1e-9);
        let volumes: Vec<f64> = (1..=closes.len())
            .map(|i| event("BTC", i as i64, 0.0).volume)
            .collect();
        expect(
            "volume_ratio_10",
            volume::calculate_volume_ratio(&volumes, 10).unwrap(),
            1e-9,
        );
    }

    #[test]
    fn as_of_serves_the_snapshot_in_force_at_that_time() {
        let engine = IndicatorEngine::new(default_indicators());
        for i in 0..30 {
            engine.update(&event("AAPL", (i + 1) * 10, 100.0 + i as f64));
        }
        let past = engine.latest_as_of("AAPL", 155).unwrap();
        assert_eq!(past.timestamp, 150);
        assert_eq!(past.sample_count, 15);
        assert!(engine.latest_as_of("AAPL", 5).is_none());
        assert_eq!(engine.latest_as_of("AAPL", 10_000).unwrap().timestamp, 300);

        // Only the last SNAPSHOT_HISTORY snapshots are retained.
        for i in 30..(30 + SNAPSHOT_HISTORY as i64) {
            engine.update(&event("AAPL", (i + 1) * 10, 100.0));
        }
        assert!(engine.latest_as_of("AAPL", 155).is_none());
    }

    #[test]
    fn batch_size_does_not_change_snapshots() {
        let closes = prices(300);
        let events: Vec<MarketEvent> = closes
            .iter()
            .enumerate()
            .map(|(i, &p)| event("ETH", i as i64 + 1, p))
            .collect();

        let one_by_one = IndicatorEngine::new(default_indicators());
        let a: Vec<IndicatorSnapshot> = events.iter().map(|e| one_by_one.update(e)).collect();

        let chunked = IndicatorEngine::new(default_indicators());
        let mut b = Vec::new();
        for chunk in events.chunks(17) {
            b.extend(chunked.update_batch(chunk));
        }
        assert_eq!(a, b);
    }

    #[test]
    fn out_of_order_update_is_ignored() {
        let engine = IndicatorEngine::new(default_indicators());
        engine.update(&event("AAPL", 10, 100.0));
        let before = engine.latest("AAPL").unwrap();
        let snap = engine.update(&event("AAPL", 5, 999.0));
        assert_eq!(snap, before);
        assert_eq!(engine.latest("AAPL").unwrap().sample_count, 1);
    }

    #[test]
    fn symbols_are_isolated() {
        let engine = IndicatorEngine::new(default_indicators());
        for i in 0..30 {
            engine.update(&event("AAPL", i + 1, 100.0 + i as f64));
        }
        engine.update(&event("MSFT", 1, 300.0));
        assert_eq!(engine.latest("MSFT").unwrap().sample_count, 1);
        assert_eq!(engine.latest("AAPL").unwrap().sample_count, 30);
    }

    #[test]
    fn indicator_spec_validation() {
        assert!(IndicatorSpec::Sma { window: 0 }.validate("x").is_err());
        assert!(IndicatorSpec::Macd { fast: 26, slow: 12, signal: 9 }
            .validate("x")
            .is_err());
        assert!(IndicatorSpec::Bollinger { window: 20, num_std: -1.0 }
            .validate("x")
            .is_err());
        for (name, spec) in default_indicators() {
            spec.validate(&name).unwrap();
        }
    }

    #[test]
    fn indicator_spec_deserialises_from_tagged_json() {
        let json = r#"{ "kind": "bollinger", "window": 20 }"#;
        let spec: IndicatorSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec, IndicatorSpec::Bollinger { window: 20, num_std: 2.0 });
    }
}
