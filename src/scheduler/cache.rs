// =============================================================================
// Signal Cache -- TTL cache of the latest signal and forecast per symbol
// =============================================================================
//
// Entries expire after `ttl` (measured on the tokio clock so tests can pause
// and advance it) and are dropped eagerly when a new event lands for the
// symbol or its model version changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::forecast::Forecast;
use crate::signals::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Signal,
    Forecast,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Signal(Arc<Signal>),
    Forecast(Arc<Forecast>),
}

impl CachedValue {
    pub fn kind(&self) -> CacheKind {
        match self {
            Self::Signal(_) => CacheKind::Signal,
            Self::Forecast(_) => CacheKind::Forecast,
        }
    }
}

struct CacheEntry {
    value: CachedValue,
    stored_at: Instant,
}

pub struct SignalCache {
    ttl: Duration,
    entries: RwLock<HashMap<(String, CacheKind), CacheEntry>>,
}

impl SignalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Live entry for `(symbol, kind)`; expired entries read as absent.
    pub fn get(&self, symbol: &str, kind: CacheKind) -> Option<CachedValue> {
        let entries = self.entries.read();
        let entry = entries.get(&(symbol.to_string(), kind))?;
        if entry.stored_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, symbol: &str, value: CachedValue) {
        self.entries.write().insert(
            (symbol.to_string(), value.kind()),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every entry for `symbol`.
    pub fn invalidate(&self, symbol: &str) {
        self.entries.write().retain(|(sym, _), _| sym != symbol);
    }

    pub fn invalidate_kind(&self, symbol: &str, kind: CacheKind) {
        self.entries.write().remove(&(symbol.to_string(), kind));
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn signal(symbol: &str) -> Arc<Signal> {
        Arc::new(Signal {
            symbol: symbol.into(),
            timestamp: 1,
            direction: Direction::Flat,
            strength: 0.0,
            confidence: 0.0,
            net_score: 0.0,
            agreement: 1.0,
            degraded: true,
            factors: Vec::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = SignalCache::new(Duration::from_secs(30));
        cache.put("AAPL", CachedValue::Signal(signal("AAPL")));
        assert!(cache.get("AAPL", CacheKind::Signal).is_some());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("AAPL", CacheKind::Signal).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("AAPL", CacheKind::Signal).is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidate_drops_only_that_symbol() {
        let cache = SignalCache::new(Duration::from_secs(30));
        cache.put("AAPL", CachedValue::Signal(signal("AAPL")));
        cache.put("MSFT", CachedValue::Signal(signal("MSFT")));
        cache.invalidate("AAPL");
        assert!(cache.get("AAPL", CacheKind::Signal).is_none());
        assert!(cache.get("MSFT", CacheKind::Signal).is_some());
        assert!(cache.get("MSFT", CacheKind::Forecast).is_none());
    }
}
