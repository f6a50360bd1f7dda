// =============================================================================
// Forecast Model Registry -- versioned per-symbol models behind atomic swaps
// =============================================================================
//
// Readers `load()` a model snapshot without taking any lock; a retrain fits a
// new `ModelSnapshot` off to the side and `store()`s it in one pointer swap.
// A failed retrain publishes nothing, so the previous version stays active.
//
//   predict ──► load() ──► Arc<ModelSnapshot> ──► project (never blocked)
//   retrain ──► fit ──► store(Arc::new(snapshot)) ──► atomic swap
//
// Retrains of the same symbol are serialised so versions are published in
// increasing order. Forecasts are kept per symbol in `(as_of, version)` order,
// the last `FORECAST_HISTORY` of them, for as-of lookups.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::arena::SymbolArena;
use crate::error::{ForecastError, RetrainError};
use crate::forecast::model::{fit_trend, Forecast, ModelSnapshot};
use crate::market_data::{PriceHistory, PricePoint};
use crate::runtime_config::ForecastConfig;
use crate::types::Timestamp;

type ModelSlot = Arc<ArcSwapOption<ModelSnapshot>>;

/// Forecasts retained per symbol.
const FORECAST_HISTORY: usize = 64;

/// Per-symbol trend models plus the latest forecast made with each.
pub struct ForecastModel {
    config: ForecastConfig,
    history: Arc<PriceHistory>,
    models: RwLock<HashMap<String, ModelSlot>>,
    /// Last published version per symbol; the lock also serialises retrains.
    versions: SymbolArena<u64>,
    forecasts: RwLock<HashMap<String, VecDeque<Forecast>>>,
}

impl ForecastModel {
    pub fn new(config: ForecastConfig, history: Arc<PriceHistory>) -> Self {
        Self {
            config,
            history,
            models: RwLock::new(HashMap::new()),
            versions: SymbolArena::new(),
            forecasts: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    fn slot(&self, symbol: &str) -> ModelSlot {
        if let Some(slot) = self.models.read().get(symbol) {
            return Arc::clone(slot);
        }
        self.models
            .write()
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(ArcSwapOption::empty()))
            .clone()
    }

    /// The active model for `symbol`, if one has been trained.
    pub fn snapshot(&self, symbol: &str) -> Option<Arc<ModelSnapshot>> {
        self.models.read().get(symbol)?.load_full()
    }

    /// Active model version, 0 when untrained.
    pub fn current_version(&self, symbol: &str) -> u64 {
        self.snapshot(symbol).map_or(0, |m| m.version)
    }

    /// Fit a new model on `history` (oldest first) and publish it.
    ///
    /// Returns the new version. On error the previous version stays active.
    pub fn retrain(&self, symbol: &str, history: &[PricePoint]) -> Result<u64, RetrainError> {
        let window = self.config.training_window.max(1);
        let start = history.len().saturating_sub(window);
        let training = &history[start..];

        self.versions.with(symbol, || 0, |version| {
            let fit = match fit_trend(symbol, training, self.config.min_history) {
                Ok(fit) => fit,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, active_version = *version, "retrain failed -- keeping previous model");
                    return Err(e);
                }
            };

            let next = *version + 1;
            let snapshot = fit.into_snapshot(symbol, next);
            info!(
                symbol = %symbol,
                version = next,
                samples = snapshot.samples,
                slope = snapshot.slope,
                r_squared = snapshot.r_squared,
                "model retrained"
            );
            self.slot(symbol).store(Some(Arc::new(snapshot)));
            *version = next;
            Ok(next)
        })
    }

    /// Retrain from the shared price history.
    pub fn retrain_from_history(&self, symbol: &str) -> Result<u64, RetrainError> {
        let points = self.history.recent(symbol, self.config.training_window);
        self.retrain(symbol, &points)
    }

    /// Forecast `horizon_ms` ahead from the newest price at or before `as_of`.
    pub fn predict(&self, symbol: &str, as_of: Timestamp, horizon_ms: i64) -> Result<Forecast, ForecastError> {
        let model = self
            .snapshot(symbol)
            .ok_or_else(|| ForecastError::NoModel(symbol.to_string()))?;
        let base = self
            .history
            .last_as_of(symbol, as_of)
            .ok_or_else(|| ForecastError::NoPrice(symbol.to_string()))?;
        model.predict(base, horizon_ms, self.config.interval_z)
    }

    /// Predict at the configured horizon and store the result as `symbol`'s
    /// latest forecast. Waits for an in-progress retrain of the same symbol.
    pub fn refresh(&self, symbol: &str, as_of: Timestamp) -> Result<Forecast, ForecastError> {
        let forecast = self
            .versions
            .with(symbol, || 0, |_| self.predict(symbol, as_of, self.config.horizon_ms))?;
        debug!(
            symbol = %symbol,
            as_of = forecast.as_of,
            point = forecast.point,
            version = forecast.model_version,
            "forecast refreshed"
        );
        self.store(forecast.clone());
        Ok(forecast)
    }

    /// File `forecast` in `(as_of, version)` order. A forecast projected from
    /// older data never becomes the latest one.
    fn store(&self, forecast: Forecast) {
        let key = (forecast.as_of, forecast.model_version);
        let mut all = self.forecasts.write();
        let ring = all.entry(forecast.symbol.clone()).or_default();
        let at = ring.partition_point(|f| (f.as_of, f.model_version) < key);
        match ring.get_mut(at) {
            Some(same) if (same.as_of, same.model_version) == key => *same = forecast,
            _ => ring.insert(at, forecast),
        }
        while ring.len() > FORECAST_HISTORY {
            ring.pop_front();
        }
    }

    /// Latest stored forecast for `symbol`.
    pub fn latest(&self, symbol: &str) -> Option<Forecast> {
        self.forecasts.read().get(symbol)?.back().cloned()
    }

    /// Newest stored forecast projected from data no newer than `ts`.
    pub fn latest_as_of(&self, symbol: &str, ts: Timestamp) -> Option<Forecast> {
        self.forecasts
            .read()
            .get(symbol)?
            .iter()
            .rev()
            .find(|f| f.as_of <= ts)
            .cloned()
    }

    /// Whether `forecast` was made with a model that has since been replaced.
    pub fn is_superseded(&self, forecast: &Forecast) -> bool {
        forecast.model_version < self.current_version(&forecast.symbol)
    }

    /// Every active model, for persistence.
    pub fn export_models(&self) -> BTreeMap<String, ModelSnapshot> {
        self.models
            .read()
            .iter()
            .filter_map(|(sym, slot)| slot.load_full().map(|m| (sym.clone(), (*m).clone())))
            .collect()
    }

    /// Run `f` while holding `symbol`'s retrain lock, as a slow retrain would.
    #[cfg(test)]
    pub(crate) fn hold_retrain_lock<R>(&self, symbol: &str, f: impl FnOnce() -> R) -> R {
        self.versions.with(symbol, || 0, |_| f())
    }

    /// Reinstall a persisted model. Later retrains continue from its version.
    pub fn restore_model(&self, snapshot: ModelSnapshot) {
        let symbol = snapshot.symbol.clone();
        self.versions.with(&symbol, || 0, |version| {
            *version = (*version).max(snapshot.version);
            self.slot(&symbol).store(Some(Arc::new(snapshot)));
        });
    }
}
