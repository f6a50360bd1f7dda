// =============================================================================
// Scheduler -- coalesced, single-flight per-symbol recomputation
// =============================================================================
//
// * At most one synthesis runs per symbol. Callers arriving while one is in
//   flight await the same `Shared` future and receive the same `Arc<Signal>`.
// * Every event or model change bumps the symbol's generation and drops its
//   cached entries. A run that finishes under an older generation is thrown
//   away and the in-flight future computes again, so joiners always receive
//   a signal built from the newest inputs.
// * Publishing (cache put plus the caller's hook) happens under the same lock
//   that bumps generations, so a stale signal is never cached or recorded.
// * Forecast refreshes run on a blocking worker bounded by a deadline.
// =============================================================================

pub mod cache;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::signals::Signal;

pub use cache::{CacheKind, CachedValue, SignalCache};

/// Re-runs of one in-flight computation before it gives up on a fresh
/// result and answers with the last one unpublished.
const MAX_RERUNS: u32 = 4;

type SharedSignal = Shared<BoxFuture<'static, Arc<Signal>>>;

struct InFlight {
    id: u64,
    future: SharedSignal,
}

#[derive(Default)]
struct SymbolSlot {
    generation: u64,
    inflight: Option<InFlight>,
}

/// Outcome of trying to publish a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Commit {
    Published,
    Stale,
}

/// Counters exposed on the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub computations: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub superseded: u64,
    pub deadline_misses: u64,
}

pub struct Scheduler {
    cache: SignalCache,
    slots: Mutex<HashMap<String, SymbolSlot>>,
    next_id: AtomicU64,
    computations: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    superseded: AtomicU64,
    deadline_misses: AtomicU64,
}

impl Scheduler {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            cache: SignalCache::new(cache_ttl),
            slots: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            computations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            superseded: AtomicU64::new(0),
            deadline_misses: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &SignalCache {
        &self.cache
    }

    /// Current generation of `symbol`.
    pub fn generation(&self, symbol: &str) -> u64 {
        self.slots.lock().get(symbol).map_or(0, |s| s.generation)
    }

    /// A new event landed for `symbol`: bump its generation and drop its
    /// cached signal.
    pub fn note_event(&self, symbol: &str) -> u64 {
        let mut slots = self.slots.lock();
        let slot = slots.entry(symbol.to_string()).or_default();
        slot.generation += 1;
        self.cache.invalidate_kind(symbol, CacheKind::Signal);
        trace!(symbol = %symbol, generation = slot.generation, "generation bumped");
        slot.generation
    }

    /// The model behind `symbol`'s forecast changed: bump the generation and
    /// drop everything cached.
    pub fn note_model_change(&self, symbol: &str) -> u64 {
        let mut slots = self.slots.lock();
        let slot = slots.entry(symbol.to_string()).or_default();
        slot.generation += 1;
        self.cache.invalidate(symbol);
        debug!(symbol = %symbol, generation = slot.generation, "model changed -- cache dropped");
        slot.generation
    }

    /// Cached value for `(symbol, kind)` if still live.
    pub fn get_cached(&self, symbol: &str, kind: CacheKind) -> Option<CachedValue> {
        self.cache.get(symbol, kind)
    }

    /// Return the cached signal, join the in-flight computation, or start
    /// one.
    ///
    /// `compute` may run more than once: a run overtaken by a newer event is
    /// repeated before anyone is answered. `publish` runs once, for the run
    /// that is still current, while the generation lock is held.
    pub async fn request<F, Fut, P>(self: &Arc<Self>, symbol: &str, compute: F, publish: P) -> Arc<Signal>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Arc<Signal>> + Send + 'static,
        P: Fn(&Arc<Signal>) + Send + 'static,
    {
        if let Some(CachedValue::Signal(signal)) = self.cache.get(symbol, CacheKind::Signal) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return signal;
        }

        let future = {
            let mut slots = self.slots.lock();
            if let Some(CachedValue::Signal(signal)) = self.cache.get(symbol, CacheKind::Signal) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return signal;
            }
            let slot = slots.entry(symbol.to_string()).or_default();

            match &slot.inflight {
                Some(running) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    running.future.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let this = Arc::clone(self);
                    let sym = symbol.to_string();
                    let future = async move {
                        let mut reruns = 0;
                        loop {
                            let generation = this.generation(&sym);
                            this.computations.fetch_add(1, Ordering::Relaxed);
                            let work = compute();
                            let signal = work.await;

                            let give_up = reruns >= MAX_RERUNS;
                            match this.commit(&sym, id, generation, &signal, &publish, give_up) {
                                Commit::Published => break signal,
                                Commit::Stale if give_up => {
                                    warn!(symbol = %sym, reruns, "inputs kept changing -- answering unpublished");
                                    break signal;
                                }
                                Commit::Stale => reruns += 1,
                            }
                        }
                    }
                    .boxed()
                    .shared();

                    slot.inflight = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    future
                }
            }
        };

        future.await
    }

    /// Publish `signal` if `generation` is still current. The in-flight slot
    /// is released on publish, or when `release` is set.
    fn commit(
        &self,
        symbol: &str,
        id: u64,
        generation: u64,
        signal: &Arc<Signal>,
        publish: &dyn Fn(&Arc<Signal>),
        release: bool,
    ) -> Commit {
        let mut slots = self.slots.lock();
        let slot = slots.entry(symbol.to_string()).or_default();

        let outcome = if slot.generation == generation {
            self.cache
                .put(symbol, CachedValue::Signal(Arc::clone(signal)));
            publish(signal);
            Commit::Published
        } else {
            self.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %symbol, generation, current = slot.generation, "recompute superseded -- running again");
            Commit::Stale
        };

        if (outcome == Commit::Published || release) && slot.inflight.as_ref().map_or(false, |r| r.id == id) {
            slot.inflight = None;
        }
        outcome
    }

    /// Run `work` on the blocking pool, waiting at most `deadline`.
    ///
    /// Returns `None` on timeout (the work keeps running and its side
    /// effects still land) or if the worker panicked.
    pub async fn run_with_deadline<T, W>(&self, label: &str, deadline: Duration, work: W) -> Option<T>
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
    {
        let handle = tokio::task::spawn_blocking(work);
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(task = %label, error = %e, "blocking worker failed");
                None
            }
            Err(_) => {
                self.deadline_misses.fetch_add(1, Ordering::Relaxed);
                debug!(task = %label, deadline_ms = deadline.as_millis() as u64, "deadline passed -- proceeding without result");
                None
            }
        }
    }

    /// Number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.inflight.is_some())
            .count()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            computations: self.computations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            deadline_misses: self.deadline_misses.load(Ordering::Relaxed),
        }
    }
}
