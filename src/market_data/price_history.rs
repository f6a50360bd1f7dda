// =============================================================================
// Price History -- bounded per-symbol ring of released price events
// =============================================================================
//
// Holds the normalizer's released `MarketEvent`s per symbol, oldest first.
// The ring is trimmed on every push to the retention horizon (relative to
// the newest sample) and to a hard sample cap. Forecast retraining and the
// narrative brief read from here; indicator state is kept separately.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::arena::SymbolArena;
use crate::types::{MarketEvent, Timestamp};

/// A retained `(timestamp, price)` observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: Timestamp,
    pub price: f64,
}

/// Thread-safe ring per symbol.
pub struct PriceHistory {
    rings: SymbolArena<VecDeque<PricePoint>>,
    horizon_ms: i64,
    max_samples: usize,
}

impl PriceHistory {
    pub fn new(horizon_ms: i64, max_samples: usize) -> Self {
        Self {
            rings: SymbolArena::new(),
            horizon_ms,
            max_samples: max_samples.max(1),
        }
    }

    /// Append a released event. Events at or before the newest retained
    /// timestamp are ignored; the normalizer already guarantees order.
    pub fn push(&self, event: &MarketEvent) {
        let cap = self.max_samples;
        let horizon = self.horizon_ms;
        self.rings.with(
            &event.symbol,
            || VecDeque::with_capacity(cap.min(1_024)),
            |ring| {
                if ring.back().map_or(false, |last| last.timestamp >= event.timestamp) {
                    return;
                }
                ring.push_back(PricePoint {
                    timestamp: event.timestamp,
                    price: event.price,
                });
                let cutoff = event.timestamp.saturating_sub(horizon);
                while ring.front().map_or(false, |p| p.timestamp < cutoff) {
                    ring.pop_front();
                }
                while ring.len() > cap {
                    ring.pop_front();
                }
            },
        );
    }

    /// The most recent `count` points, oldest first.
    pub fn recent(&self, symbol: &str, count: usize) -> Vec<PricePoint> {
        match self.rings.get(symbol) {
            Some(slot) => {
                let ring = slot.lock();
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// The most recent `count` prices, oldest first.
    pub fn closes(&self, symbol: &str, count: usize) -> Vec<f64> {
        self.recent(symbol, count).iter().map(|p| p.price).collect()
    }

    pub fn last(&self, symbol: &str) -> Option<PricePoint> {
        self.rings.get(symbol)?.lock().back().copied()
    }

    /// Newest retained point at or before `ts`.
    pub fn last_as_of(&self, symbol: &str, ts: Timestamp) -> Option<PricePoint> {
        let slot = self.rings.get(symbol)?;
        let ring = slot.lock();
        ring.iter().rev().find(|p| p.timestamp <= ts).copied()
    }

    /// Percent change from the oldest to the newest retained price.
    pub fn change_pct(&self, symbol: &str) -> Option<f64> {
        let slot = self.rings.get(symbol)?;
        let ring = slot.lock();
        let first = ring.front()?;
        let last = ring.back()?;
        if ring.len() < 2 {
            return None;
        }
        Some((last.price / first.price - 1.0) * 100.0)
    }

    pub fn count(&self, symbol: &str) -> usize {
        self.rings.get(symbol).map_or(0, |slot| slot.lock().len())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.rings.symbols()
    }

    /// Replace `symbol`'s ring with persisted points (already ordered).
    pub fn restore(&self, symbol: &str, points: Vec<PricePoint>) {
        let cap = self.max_samples;
        self.rings.with(symbol, VecDeque::new, |ring| {
            ring.clear();
            let start = points.len().saturating_sub(cap);
            ring.extend(points.into_iter().skip(start));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: Timestamp, price: f64) -> MarketEvent {
        MarketEvent {
            symbol: "AAPL".into(),
            timestamp: ts,
            price,
            volume: 0.0,
        }
    }

    #[test]
    fn ring_is_trimmed_to_sample_cap() {
        let h = PriceHistory::new(i64::MAX, 3);
        for i in 0..5 {
            h.push(&event(i + 1, 100.0 + i as f64));
        }
        assert_eq!(h.count("AAPL"), 3);
        assert_eq!(h.closes("AAPL", 10), vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn ring_is_trimmed_to_horizon() {
        let h = PriceHistory::new(1_000, 100);
        h.push(&event(1_000, 1.0));
        h.push(&event(1_500, 2.0));
        h.push(&event(2_600, 3.0));
        assert_eq!(h.closes("AAPL", 10), vec![3.0]);
    }

    #[test]
    fn out_of_order_push_is_ignored() {
        let h = PriceHistory::new(i64::MAX, 10);
        h.push(&event(2, 2.0));
        h.push(&event(1, 1.0));
        h.push(&event(2, 9.0));
        assert_eq!(h.closes("AAPL", 10), vec![2.0]);
    }

    #[test]
    fn last_as_of_and_change() {
        let h = PriceHistory::new(i64::MAX, 10);
        h.push(&event(10, 100.0));
        h.push(&event(20, 110.0));
        assert_eq!(h.last_as_of("AAPL", 15).map(|p| p.price), Some(100.0));
        assert!((h.change_pct("AAPL").unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(h.last("MSFT"), None);
        assert_eq!(h.change_pct("MSFT"), None);
    }
}
