// =============================================================================
// Runtime Configuration -- engine settings with validation and atomic save
// =============================================================================
//
// Central configuration hub for the Aurora synthesis engine. Every tunable
// parameter lives here.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// `validate()` runs once at startup. Invalid weights, unknown indicator names
// and impossible windows are fatal there, never later.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::indicators::{default_indicators, IndicatorSpec};
use crate::signals::rules::{default_rules, IndicatorRule};
use crate::types::SourceKind;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "GOOGL".to_string(),
        "MSFT".to_string(),
        "AMZN".to_string(),
        "TSLA".to_string(),
    ]
}

fn default_tolerance_ms() -> i64 {
    2_000
}

fn default_horizon_ms() -> i64 {
    5 * 24 * 3_600_000
}

fn default_max_samples() -> usize {
    5_000
}

fn default_training_window() -> usize {
    120
}

fn default_min_history() -> usize {
    30
}

fn default_forecast_horizon_ms() -> i64 {
    3_600_000
}

fn default_interval_z() -> f64 {
    1.96
}

fn default_forecast_cadence_ms() -> u64 {
    60_000
}

fn default_retrain_cadence_ms() -> u64 {
    600_000
}

fn default_deadline_ms() -> u64 {
    250
}

fn default_half_life_ms() -> i64 {
    6 * 3_600_000
}

fn default_prior_weight() -> f64 {
    1.0
}

fn default_prior_count() -> f64 {
    3.0
}

fn default_reliability() -> f64 {
    1.0
}

fn default_neutral_band() -> f64 {
    0.05
}

fn default_flat_threshold() -> f64 {
    0.05
}

fn default_conflict_threshold() -> f64 {
    0.2
}

fn default_confidence_floor() -> f64 {
    0.05
}

fn default_synthesis_interval_ms() -> u64 {
    5_000
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}

fn default_max_recent_signals() -> usize {
    100
}

fn default_state_path() -> String {
    "engine_state.json".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Out-of-order handling in the normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// How far behind the newest event of a symbol an event may arrive and
    /// still be reordered into the stream.
    #[serde(default = "default_tolerance_ms")]
    pub out_of_order_tolerance_ms: i64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            out_of_order_tolerance_ms: default_tolerance_ms(),
        }
    }
}

/// Sliding retention window for per-symbol history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_horizon_ms")]
    pub horizon_ms: i64,

    /// Hard cap on retained price samples per symbol.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            horizon_ms: default_horizon_ms(),
            max_samples: default_max_samples(),
        }
    }
}

/// Forecast model and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Number of most recent prices the trend model is fitted on.
    #[serde(default = "default_training_window")]
    pub training_window: usize,

    /// Minimum prices before a retrain is attempted.
    #[serde(default = "default_min_history")]
    pub min_history: usize,

    #[serde(default = "default_forecast_horizon_ms")]
    pub horizon_ms: i64,

    /// z-score of the confidence interval (1.96 ≈ 95%).
    #[serde(default = "default_interval_z")]
    pub interval_z: f64,

    #[serde(default = "default_forecast_cadence_ms")]
    pub cadence_ms: u64,

    #[serde(default = "default_retrain_cadence_ms")]
    pub retrain_cadence_ms: u64,

    /// Upper bound on waiting for a fresh forecast before synthesis.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            training_window: default_training_window(),
            min_history: default_min_history(),
            horizon_ms: default_forecast_horizon_ms(),
            interval_z: default_interval_z(),
            cadence_ms: default_forecast_cadence_ms(),
            retrain_cadence_ms: default_retrain_cadence_ms(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

/// Sentiment decay and shrinkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentConfig {
    #[serde(default = "default_half_life_ms")]
    pub half_life_ms: i64,

    /// Pseudo-weight added to the denominator so sparse news shrinks to zero.
    #[serde(default = "default_prior_weight")]
    pub prior_weight: f64,

    /// Decayed sample count at which confidence reaches 0.5.
    #[serde(default = "default_prior_count")]
    pub prior_count: f64,

    /// Reliability per named source, in [0, 1].
    #[serde(default)]
    pub source_reliability: BTreeMap<String, f64>,

    /// Reliability of sources not listed above.
    #[serde(default = "default_reliability")]
    pub default_reliability: f64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            half_life_ms: default_half_life_ms(),
            prior_weight: default_prior_weight(),
            prior_count: default_prior_count(),
            source_reliability: BTreeMap::new(),
            default_reliability: default_reliability(),
        }
    }
}

/// A value per upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerSource<T> {
    pub indicator: T,
    pub forecast: T,
    pub sentiment: T,
}

impl<T: Copy> PerSource<T> {
    pub fn get(&self, kind: SourceKind) -> T {
        match kind {
            SourceKind::Indicator => self.indicator,
            SourceKind::Forecast => self.forecast,
            SourceKind::Sentiment => self.sentiment,
        }
    }
}

fn default_base_weights() -> PerSource<f64> {
    PerSource {
        indicator: 0.4,
        forecast: 0.4,
        sentiment: 0.2,
    }
}

fn default_max_age_ms() -> PerSource<i64> {
    PerSource {
        indicator: 5 * 60_000,
        forecast: 3_600_000,
        sentiment: 6 * 3_600_000,
    }
}

/// Fusion weights and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_base_weights")]
    pub base_weights: PerSource<f64>,

    /// Age after which a source's weight starts to decay.
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: PerSource<i64>,

    /// Sub-signal strengths below this read as flat.
    #[serde(default = "default_neutral_band")]
    pub neutral_band: f64,

    /// Net scores below this read as flat.
    #[serde(default = "default_flat_threshold")]
    pub flat_threshold: f64,

    /// Agreement below this is treated as a conflict and reads as flat.
    #[serde(default = "default_conflict_threshold")]
    pub conflict_threshold: f64,

    /// Confidence cap for signals with no fresh input at all.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_weights: default_base_weights(),
            max_age_ms: default_max_age_ms(),
            neutral_band: default_neutral_band(),
            flat_threshold: default_flat_threshold(),
            conflict_threshold: default_conflict_threshold(),
            confidence_floor: default_confidence_floor(),
        }
    }
}

/// Recompute cadence and cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_synthesis_interval_ms")]
    pub synthesis_interval_ms: u64,

    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Schedule a recompute for a symbol as soon as one of its events lands.
    #[serde(default = "default_true")]
    pub recompute_on_event: bool,

    /// Per-symbol signal history kept for the dashboard.
    #[serde(default = "default_max_recent_signals")]
    pub max_recent_signals: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            synthesis_interval_ms: default_synthesis_interval_ms(),
            cache_ttl_ms: default_cache_ttl_ms(),
            recompute_on_event: true,
            max_recent_signals: default_max_recent_signals(),
        }
    }
}

/// Restart-recovery snapshot location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_state_path")]
    pub path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_state_path(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_market_feed() -> Option<String> {
    Some("-".to_string())
}

/// Feed sources and HTTP listener. A feed of `-` reads stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_market_feed")]
    pub market_feed: Option<String>,

    #[serde(default)]
    pub news_feed: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            market_feed: default_market_feed(),
            news_feed: None,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the synthesis engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// still deserialise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols the engine schedules recomputes for.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub normalizer: NormalizerConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    /// Indicator set: name → formula and window.
    #[serde(default = "default_indicators")]
    pub indicators: BTreeMap<String, IndicatorSpec>,

    /// Rules turning indicator readings into directional votes.
    #[serde(default = "default_rules")]
    pub indicator_rules: Vec<IndicatorRule>,

    #[serde(default)]
    pub forecast: ForecastConfig,

    #[serde(default)]
    pub sentiment: SentimentConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            normalizer: NormalizerConfig::default(),
            retention: RetentionConfig::default(),
            indicators: default_indicators(),
            indicator_rules: default_rules(),
            forecast: ForecastConfig::default(),
            sentiment: SentimentConfig::default(),
            synthesis: SynthesisConfig::default(),
            scheduler: SchedulerConfig::default(),
            persistence: PersistenceConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

fn check_unit(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("{value} is not in [0, 1]"),
        })
    }
}

fn check_positive_ms(field: &str, value: i64) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("{value} must be positive"),
        })
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            indicators = config.indicators.len(),
            rules = config.indicator_rules.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Apply `SYNTH_*` environment overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(syms) = var("SYNTH_SYMBOLS") {
            self.symbols = syms
                .split(',')
                .map(crate::types::normalize_symbol)
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(addr) = var("SYNTH_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(feed) = var("SYNTH_MARKET_FEED") {
            self.server.market_feed = Some(feed).filter(|f| !f.trim().is_empty());
        }
        if let Some(feed) = var("SYNTH_NEWS_FEED") {
            self.server.news_feed = Some(feed).filter(|f| !f.trim().is_empty());
        }
        if let Some(path) = var("SYNTH_STATE_PATH") {
            self.persistence.path = path;
        }
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // --- Weights --------------------------------------------------------
        let mut total = 0.0;
        for kind in SourceKind::ALL {
            let w = self.synthesis.base_weights.get(kind);
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    name: kind.to_string(),
                    value: w,
                });
            }
            total += w;
            check_positive_ms(
                &format!("synthesis.max_age_ms.{kind}"),
                self.synthesis.max_age_ms.get(kind),
            )?;
        }
        if total <= 0.0 {
            return Err(ConfigError::ZeroWeights);
        }

        check_unit("synthesis.neutral_band", self.synthesis.neutral_band)?;
        check_unit("synthesis.flat_threshold", self.synthesis.flat_threshold)?;
        check_unit("synthesis.conflict_threshold", self.synthesis.conflict_threshold)?;
        check_unit("synthesis.confidence_floor", self.synthesis.confidence_floor)?;

        // --- Indicators & rules ---------------------------------------------
        for (name, spec) in &self.indicators {
            spec.validate(name)?;
        }
        for (idx, rule) in self.indicator_rules.iter().enumerate() {
            rule.validate(idx, &self.indicators)?;
        }

        // --- Windows & cadences ---------------------------------------------
        if self.normalizer.out_of_order_tolerance_ms < 0 {
            return Err(ConfigError::InvalidValue {
                field: "normalizer.out_of_order_tolerance_ms".into(),
                reason: "must not be negative".into(),
            });
        }
        check_positive_ms("retention.horizon_ms", self.retention.horizon_ms)?;
        if self.retention.max_samples < self.forecast.training_window {
            return Err(ConfigError::InvalidValue {
                field: "retention.max_samples".into(),
                reason: "must be at least forecast.training_window".into(),
            });
        }
        if self.forecast.min_history < 3 || self.forecast.min_history > self.forecast.training_window {
            return Err(ConfigError::InvalidValue {
                field: "forecast.min_history".into(),
                reason: "must be in [3, training_window]".into(),
            });
        }
        check_positive_ms("forecast.horizon_ms", self.forecast.horizon_ms)?;
        if !self.forecast.interval_z.is_finite() || self.forecast.interval_z <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "forecast.interval_z".into(),
                reason: "must be positive".into(),
            });
        }
        check_positive_ms("sentiment.half_life_ms", self.sentiment.half_life_ms)?;
        if !(self.sentiment.prior_weight >= 0.0 && self.sentiment.prior_count > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "sentiment.prior_*".into(),
                reason: "prior_weight must be >= 0 and prior_count > 0".into(),
            });
        }
        check_unit("sentiment.default_reliability", self.sentiment.default_reliability)?;
        for (source, r) in &self.sentiment.source_reliability {
            check_unit(&format!("sentiment.source_reliability.{source}"), *r)?;
        }
        for (field, ms) in [
            ("scheduler.synthesis_interval_ms", self.scheduler.synthesis_interval_ms),
            ("forecast.cadence_ms", self.forecast.cadence_ms),
            ("forecast.retrain_cadence_ms", self.forecast.retrain_cadence_ms),
        ] {
            if ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    reason: "must be positive".into(),
                });
            }
        }

        Ok(())
    }
}
