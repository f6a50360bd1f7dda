// =============================================================================
// Engine Persistence -- snapshot engine state across restarts
// =============================================================================
//
// One JSON document per engine, written atomically (tmp + rename). Indicator
// windows are not stored directly: the retained price history is replayed
// through the indicator engine on restore, which rebuilds every window and
// seeds the normalizer watermark so that old events replayed by a feed are
// rejected as late instead of double-counted.
//
// A snapshot written under a different `schema_version` is refused; the
// caller starts empty.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::SynthesisEngine;
use crate::forecast::ModelSnapshot;
use crate::indicators::IndicatorSnapshot;
use crate::market_data::PricePoint;
use crate::sentiment::SentimentAccumulator;
use crate::types::MarketEvent;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    #[serde(default)]
    pub prices: Vec<PricePoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicators: Option<IndicatorSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<SentimentAccumulator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub schema_version: u32,
    /// Wall-clock ISO 8601 time of capture.
    pub saved_at: String,
    pub symbols: BTreeMap<String, SymbolState>,
}

/// What a restore put back, for the startup log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub symbols: usize,
    pub prices: usize,
    pub models: usize,
    pub sentiment: usize,
}

impl EngineSnapshot {
    /// Copy the restorable state out of `engine`.
    pub fn capture(engine: &SynthesisEngine) -> Self {
        let mut symbols: BTreeMap<String, SymbolState> = BTreeMap::new();

        for symbol in engine.history().symbols() {
            let prices = engine.history().recent(&symbol, usize::MAX);
            symbols.entry(symbol.clone()).or_default().prices = prices;
        }
        for snapshot in engine.indicators().all_latest() {
            let symbol = snapshot.symbol.clone();
            symbols.entry(symbol).or_default().indicators = Some(snapshot);
        }
        for (symbol, acc) in engine.sentiment().export() {
            symbols.entry(symbol).or_default().sentiment = Some(acc);
        }
        for (symbol, model) in engine.forecasts().export_models() {
            symbols.entry(symbol).or_default().model = Some(model);
        }

        Self {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now().to_rfc3339(),
            symbols,
        }
    }

    /// Atomic write: serialise to `<path>.tmp`, then rename over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string(self).context("failed to serialise engine snapshot to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        info!(path = %path.display(), symbols = self.symbols.len(), "engine state saved (atomic)");
        Ok(())
    }

    /// Read a snapshot, refusing one written under another schema version.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine snapshot from {}", path.display()))?;

        // Check the version before decoding the body so a changed layout
        // reports as a version mismatch, not a parse error.
        let header: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine snapshot from {}", path.display()))?;
        let version = header["schema_version"].as_u64().unwrap_or(0);
        if version != u64::from(SCHEMA_VERSION) {
            bail!(
                "engine snapshot schema version {version} does not match expected {SCHEMA_VERSION}"
            );
        }

        serde_json::from_value(header)
            .with_context(|| format!("failed to decode engine snapshot from {}", path.display()))
    }

    /// Put the captured state back into a freshly built engine.
    pub fn restore_into(self, engine: &SynthesisEngine) -> RestoreSummary {
        let mut summary = RestoreSummary::default();

        for (symbol, state) in self.symbols {
            summary.symbols += 1;

            if let Some(last) = state.prices.last().copied() {
                for point in &state.prices {
                    engine.indicators().update(&MarketEvent {
                        symbol: symbol.clone(),
                        timestamp: point.timestamp,
                        price: point.price,
                        volume: 0.0,
                    });
                }
                summary.prices += state.prices.len();
                engine.history().restore(&symbol, state.prices);
                engine.normalizer().restore_watermark(&symbol, last.timestamp);
            }
            if let Some(snapshot) = state.indicators {
                engine.indicators().restore(snapshot);
            }
            if let Some(acc) = state.sentiment {
                engine.sentiment().restore(&symbol, acc);
                summary.sentiment += 1;
            }
            if let Some(model) = state.model {
                engine.forecasts().restore_model(model);
                summary.models += 1;
                if let Err(e) = engine.refresh_forecast(&symbol) {
                    tracing::debug!(symbol = %symbol, error = %e, "no forecast after restore");
                }
            }
        }

        info!(
            symbols = summary.symbols,
            prices = summary.prices,
            models = summary.models,
            sentiment = summary.sentiment,
            "engine state restored"
        );
        summary
    }
}
