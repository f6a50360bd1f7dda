// =============================================================================
// Symbol Arena -- per-symbol state slots with single-writer discipline
// =============================================================================
//
// Every component that keeps per-symbol mutable state (normalizer streams,
// indicator windows, sentiment accumulators) stores it in a `SymbolArena`.
// The outer map is only write-locked to create a new slot; after that each
// symbol is guarded by its own mutex, so updates to one symbol serialise
// while different symbols proceed in parallel.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Arena of per-symbol state objects addressed by symbol key.
pub struct SymbolArena<T> {
    slots: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T> SymbolArena<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Return the slot for `symbol`, creating it with `init` on first use.
    pub fn slot(&self, symbol: &str, init: impl FnOnce() -> T) -> Arc<Mutex<T>> {
        if let Some(slot) = self.slots.read().get(symbol) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    /// Existing slot for `symbol`, if any.
    pub fn get(&self, symbol: &str) -> Option<Arc<Mutex<T>>> {
        self.slots.read().get(symbol).cloned()
    }

    /// Run `f` with exclusive access to `symbol`'s state.
    ///
    /// The outer map lock is released before `f` runs.
    pub fn with<R>(&self, symbol: &str, init: impl FnOnce() -> T, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.slot(symbol, init);
        let mut guard = slot.lock();
        f(&mut guard)
    }

    /// Known symbols in sorted order.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.slots.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl<T> Default for SymbolArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
