// =============================================================================
// Synthesis Engine -- central state shared by every task
// =============================================================================
//
// The single owner of every component. Feed readers, cadence loops and the
// REST API all hold an `Arc<SynthesisEngine>`.
//
//   raw line ─► DataNormalizer ─┬─► PriceHistory ─► ForecastModel ─┐
//                               ├─► IndicatorEngine ───────────────┼─► SignalSynthesizer
//                               └─► SentimentAggregator ───────────┘        │
//                                                       Scheduler (coalesce, cache)
//
// Thread safety:
//   - Per-symbol component state lives in `SymbolArena` slots.
//   - Atomic counters for ingest statistics and the state version.
//   - parking_lot::RwLock for the dashboard rings (signals, warnings).
// =============================================================================

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::{ConfigError, ForecastError, IngestError, RetrainError};
use crate::forecast::{Forecast, ForecastModel};
use crate::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::market_data::{DataNormalizer, FeedLine, Normalized, NoOpReason, PriceHistory, RawEvent};
use crate::narrative::{
    indicator_value, is_volatility, is_volume_ratio, BriefParts, MarketRisk, NarrativeBrief, RankedSignal,
};
use crate::runtime_config::EngineConfig;
use crate::scheduler::{CacheKind, CachedValue, Scheduler, SchedulerStats};
use crate::sentiment::{KeywordScorer, PolarityScorer, SentimentAggregator, SentimentScore};
use crate::signals::{Signal, SignalSynthesizer, SynthesisInputs};
use crate::types::{MarketEvent, Timestamp};

/// Maximum number of recent ingest warnings to retain.
const MAX_RECENT_WARNINGS: usize = 200;

// =============================================================================
// Records & stats
// =============================================================================

/// A rejected event or failed retrain, for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WarningRecord {
    /// Machine-readable code (`LATE`, `MALFORMED`, `RETRAIN`, ...).
    pub code: String,
    pub message: String,
    pub symbol: Option<String>,
    /// Wall-clock ISO 8601 timestamp.
    pub at: String,
}

#[derive(Debug, Default)]
struct IngestCounters {
    received: AtomicU64,
    market_released: AtomicU64,
    news_accepted: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    late: AtomicU64,
    unscoreable: AtomicU64,
    retrain_failures: AtomicU64,
}

/// Ingest counters as served by the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub received: u64,
    pub market_released: u64,
    pub news_accepted: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub late: u64,
    pub unscoreable: u64,
    pub retrain_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state_version: u64,
    pub uptime_secs: u64,
    pub watermark: Timestamp,
    pub symbols: Vec<String>,
    pub ingest: IngestStats,
    pub scheduler: SchedulerStats,
}

// =============================================================================
// SynthesisEngine
// =============================================================================

pub struct SynthesisEngine {
    /// Incremented on every published signal or model change.
    state_version: AtomicU64,

    config: EngineConfig,

    // ── Components ──────────────────────────────────────────────────────
    normalizer: DataNormalizer,
    history: Arc<PriceHistory>,
    indicators: IndicatorEngine,
    forecasts: Arc<ForecastModel>,
    sentiment: SentimentAggregator,
    synthesizer: SignalSynthesizer,
    scheduler: Arc<Scheduler>,

    // ── Dashboard rings ─────────────────────────────────────────────────
    recent_signals: RwLock<HashMap<String, VecDeque<Arc<Signal>>>>,
    recent_warnings: RwLock<VecDeque<WarningRecord>>,

    counters: IngestCounters,
    start_time: Instant,
}

impl SynthesisEngine {
    /// Validate `config` and build every component with the keyword scorer.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_scorer(config, Arc::new(KeywordScorer::new()))
    }

    /// Build with a custom polarity scorer for unscored news text.
    pub fn with_scorer(config: EngineConfig, scorer: Arc<dyn PolarityScorer>) -> Result<Self, ConfigError> {
        config.validate()?;

        let history = Arc::new(PriceHistory::new(
            config.retention.horizon_ms,
            config.retention.max_samples,
        ));
        let forecasts = Arc::new(ForecastModel::new(config.forecast.clone(), history.clone()));

        Ok(Self {
            state_version: AtomicU64::new(1),
            normalizer: DataNormalizer::new(config.normalizer.out_of_order_tolerance_ms, scorer),
            indicators: IndicatorEngine::new(config.indicators.clone()),
            sentiment: SentimentAggregator::new(config.sentiment.clone()),
            synthesizer: SignalSynthesizer::new(config.synthesis.clone(), config.indicator_rules.clone()),
            scheduler: Arc::new(Scheduler::new(Duration::from_millis(config.scheduler.cache_ttl_ms))),
            history,
            forecasts,
            recent_signals: RwLock::new(HashMap::new()),
            recent_warnings: RwLock::new(VecDeque::new()),
            counters: IngestCounters::default(),
            start_time: Instant::now(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &DataNormalizer {
        &self.normalizer
    }

    pub fn history(&self) -> &PriceHistory {
        &self.history
    }

    pub fn indicators(&self) -> &IndicatorEngine {
        &self.indicators
    }

    pub fn forecasts(&self) -> &ForecastModel {
        &self.forecasts
    }

    pub fn sentiment(&self) -> &SentimentAggregator {
        &self.sentiment
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // ── Version Management ──────────────────────────────────────────────

    fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Event-time watermark: newest event time seen on any stream.
    pub fn watermark(&self) -> Timestamp {
        self.normalizer.global_watermark()
    }

    // ── Ingest ──────────────────────────────────────────────────────────

    /// Parse, normalize and route one raw feed line.
    pub fn ingest_line(&self, line: &str) -> Result<Normalized, IngestError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let result = crate::market_data::parse_raw_line(line).and_then(|raw| self.normalizer.ingest(raw));
        self.route(result)
    }

    /// Normalize and route one already-parsed event.
    pub fn ingest(&self, raw: RawEvent) -> Result<Normalized, IngestError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let result = self.normalizer.ingest(raw);
        self.route(result)
    }

    fn route(&self, result: Result<Normalized, IngestError>) -> Result<Normalized, IngestError> {
        match &result {
            Ok(Normalized::Market(events)) => self.apply_market(events),
            Ok(Normalized::News { event, late }) => {
                self.counters.news_accepted.fetch_add(1, Ordering::Relaxed);
                for dropped in late {
                    self.record_rejection(dropped);
                }
                for score in self.sentiment.ingest(event) {
                    self.scheduler.note_event(&score.symbol);
                }
            }
            Ok(Normalized::NoOp(NoOpReason::Duplicate)) => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.record_rejection(e),
        }
        result
    }

    fn apply_market(&self, events: &[MarketEvent]) {
        for event in events {
            self.history.push(event);
            self.indicators.update(event);
            self.scheduler.note_event(&event.symbol);
        }
        self.counters
            .market_released
            .fetch_add(events.len() as u64, Ordering::Relaxed);
    }

    fn record_rejection(&self, error: &IngestError) {
        let counter = match error {
            IngestError::Malformed(_) => &self.counters.malformed,
            IngestError::Late { .. } => &self.counters.late,
            IngestError::Unscoreable { .. } => &self.counters.unscoreable,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let symbol = match error {
            IngestError::Late { symbol, .. } => Some(symbol.clone()),
            _ => None,
        };
        warn!(code = error.code(), error = %error, "event rejected");
        self.push_warning(error.code(), error.to_string(), symbol);
    }

    /// Record a warning. The ring is capped at [`MAX_RECENT_WARNINGS`].
    pub fn push_warning(&self, code: &str, message: String, symbol: Option<String>) {
        let record = WarningRecord {
            code: code.to_string(),
            message,
            symbol,
            at: Utc::now().to_rfc3339(),
        };
        let mut warnings = self.recent_warnings.write();
        warnings.push_back(record);
        while warnings.len() > MAX_RECENT_WARNINGS {
            warnings.pop_front();
        }
    }

    /// Release every held price event (end of a replay or shutdown).
    pub fn flush_all(&self) -> usize {
        let released = self.normalizer.flush_all();
        self.apply_market(&released);
        released.len()
    }

    /// Symbols whose state `outcome` touched.
    pub fn touched_symbols(outcome: &Normalized) -> Vec<String> {
        let set: BTreeSet<String> = match outcome {
            Normalized::Market(events) => events.iter().map(|e| e.symbol.clone()).collect(),
            Normalized::News { event, .. } => event.mentions.iter().map(|m| m.symbol.clone()).collect(),
            Normalized::NoOp(_) => BTreeSet::new(),
        };
        set.into_iter().collect()
    }

    /// Consume the ingest channel until every producer hangs up.
    pub async fn run_ingest(self: Arc<Self>, mut rx: mpsc::Receiver<FeedLine>) {
        info!("ingest worker started");
        while let Some(msg) = rx.recv().await {
            trace!(feed = %msg.feed, "feed line received");
            if let Ok(outcome) = self.ingest_line(&msg.line) {
                if self.config.scheduler.recompute_on_event {
                    for symbol in Self::touched_symbols(&outcome) {
                        self.schedule_recompute(&symbol);
                    }
                }
            }
        }
        let flushed = self.flush_all();
        info!(flushed, "ingest channel closed -- held events flushed");
    }

    // ── Forecasting ─────────────────────────────────────────────────────

    /// Retrain `symbol`'s model from retained history. On success the new
    /// model immediately produces a fresh forecast and cached values for the
    /// symbol are dropped.
    pub fn retrain(&self, symbol: &str) -> Result<u64, RetrainError> {
        match self.forecasts.retrain_from_history(symbol) {
            Ok(version) => {
                self.scheduler.note_model_change(symbol);
                if let Err(e) = self.refresh_forecast(symbol) {
                    debug!(symbol = %symbol, error = %e, "post-retrain forecast unavailable");
                }
                self.increment_version();
                Ok(version)
            }
            Err(e) => {
                self.counters.retrain_failures.fetch_add(1, Ordering::Relaxed);
                self.push_warning("RETRAIN", e.to_string(), Some(symbol.to_string()));
                Err(e)
            }
        }
    }

    /// Produce and store a forecast at the watermark.
    pub fn refresh_forecast(&self, symbol: &str) -> Result<Forecast, ForecastError> {
        let forecast = self.forecasts.refresh(symbol, self.watermark())?;
        self.scheduler
            .cache()
            .put(symbol, CachedValue::Forecast(Arc::new(forecast.clone())));
        Ok(forecast)
    }

    /// Whether `symbol` has a model but no forecast reflecting recent prices.
    fn forecast_is_stale(&self, symbol: &str) -> bool {
        if self.forecasts.current_version(symbol) == 0 {
            return false;
        }
        let Some(forecast) = self.forecasts.latest(symbol) else {
            return true;
        };
        if self.forecasts.is_superseded(&forecast) {
            return true;
        }
        let cadence = self.config.forecast.cadence_ms as i64;
        self.history
            .last(symbol)
            .map_or(false, |p| p.timestamp - forecast.as_of >= cadence)
    }

    /// Refresh a stale forecast on the blocking pool, waiting at most the
    /// configured deadline. Synthesis proceeds with what is there either way.
    async fn refresh_forecast_within_deadline(&self, symbol: &str) {
        if !self.forecast_is_stale(symbol) {
            return;
        }
        let forecasts = self.forecasts.clone();
        let sym = symbol.to_string();
        let as_of = self.watermark();
        let deadline = Duration::from_millis(self.config.forecast.deadline_ms);

        let refreshed = self
            .scheduler
            .run_with_deadline("forecast_refresh", deadline, move || forecasts.refresh(&sym, as_of))
            .await;
        match refreshed {
            Some(Ok(forecast)) => self
                .scheduler
                .cache()
                .put(symbol, CachedValue::Forecast(Arc::new(forecast))),
            Some(Err(e)) => debug!(symbol = %symbol, error = %e, "forecast refresh failed"),
            None => debug!(symbol = %symbol, "using stale forecast"),
        }
    }

    // ── Synthesis ───────────────────────────────────────────────────────

    /// Gather the latest component outputs for `symbol` as of `ts`.
    pub fn gather_inputs(&self, symbol: &str, ts: Timestamp) -> SynthesisInputs {
        let forecast = self.forecasts.latest_as_of(symbol, ts);
        let forecast_superseded = forecast
            .as_ref()
            .map_or(false, |f| self.forecasts.is_superseded(f));
        SynthesisInputs {
            symbol: symbol.to_string(),
            timestamp: ts,
            indicators: self.indicators.latest_as_of(symbol, ts),
            forecast,
            forecast_superseded,
            sentiment: self.sentiment.score_at(symbol, ts),
        }
    }

    /// Fuse the inputs for `symbol` at event time `ts` (clamped to the
    /// watermark) without recording the result.
    pub fn compute_signal(&self, symbol: &str, ts: Timestamp) -> Signal {
        let ts = ts.min(self.watermark());
        self.synthesizer.synthesize(&self.gather_inputs(symbol, ts))
    }

    /// Synthesise a signal for `symbol` at event time `ts` and record it.
    pub fn synthesize_at(&self, symbol: &str, ts: Timestamp) -> Signal {
        let signal = self.compute_signal(symbol, ts);
        self.record_signal(Arc::new(signal.clone()));
        signal
    }

    /// Synthesise at the watermark.
    pub fn synthesize_now(&self, symbol: &str) -> Signal {
        self.synthesize_at(symbol, self.watermark())
    }

    fn record_signal(&self, signal: Arc<Signal>) {
        debug!(
            symbol = %signal.symbol,
            direction = %signal.direction,
            confidence = signal.confidence,
            net = signal.net_score,
            degraded = signal.degraded,
            "signal synthesised"
        );
        let cap = self.config.scheduler.max_recent_signals.max(1);
        let mut recent = self.recent_signals.write();
        let ring = recent.entry(signal.symbol.clone()).or_default();
        ring.push_back(signal);
        while ring.len() > cap {
            ring.pop_front();
        }
        drop(recent);
        self.increment_version();
    }

    /// Cached, coalesced signal for `symbol`. Refreshes a stale forecast
    /// first, bounded by the forecast deadline. Only a signal computed from
    /// the newest inputs is recorded.
    pub async fn signal(self: &Arc<Self>, symbol: &str) -> Arc<Signal> {
        let engine = Arc::clone(self);
        let publisher = Arc::clone(self);
        let sym = symbol.to_string();
        self.scheduler
            .request(
                symbol,
                move || {
                    let engine = engine.clone();
                    let sym = sym.clone();
                    async move {
                        engine.refresh_forecast_within_deadline(&sym).await;
                        Arc::new(engine.compute_signal(&sym, engine.watermark()))
                    }
                },
                move |signal| publisher.record_signal(Arc::clone(signal)),
            )
            .await
    }

    /// Fire-and-forget recompute for `symbol`.
    pub fn schedule_recompute(self: &Arc<Self>, symbol: &str) {
        let engine = Arc::clone(self);
        let sym = symbol.to_string();
        tokio::spawn(async move {
            engine.signal(&sym).await;
        });
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Configured symbols plus every symbol seen on a feed, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut set: BTreeSet<String> = self.config.symbols.iter().cloned().collect();
        set.extend(self.history.symbols());
        set.extend(self.sentiment.symbols());
        set.into_iter().collect()
    }

    /// Most recent published signal for `symbol`.
    pub fn latest_signal(&self, symbol: &str) -> Option<Arc<Signal>> {
        if let Some(CachedValue::Signal(s)) = self.scheduler.get_cached(symbol, CacheKind::Signal) {
            return Some(s);
        }
        self.recent_signals.read().get(symbol)?.back().cloned()
    }

    /// Signal history for `symbol`, oldest first.
    pub fn recent_signals(&self, symbol: &str) -> Vec<Arc<Signal>> {
        self.recent_signals
            .read()
            .get(symbol)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest signal per symbol, ranked by confidence (then symbol), each
    /// annotated with its risk level and volume ratio at the signal time.
    pub fn ranked_signals(&self) -> Vec<RankedSignal> {
        let specs = &self.config.indicators;
        let mut all: Vec<RankedSignal> = self
            .symbols()
            .iter()
            .filter_map(|s| self.latest_signal(s))
            .map(|signal| {
                let snapshot = self.indicators.latest_as_of(&signal.symbol, signal.timestamp);
                RankedSignal::new(
                    (*signal).clone(),
                    indicator_value(specs, snapshot.as_ref(), is_volatility),
                    indicator_value(specs, snapshot.as_ref(), is_volume_ratio),
                )
            })
            .collect();
        all.sort_by(|a, b| {
            b.signal
                .confidence
                .total_cmp(&a.signal.confidence)
                .then_with(|| a.signal.symbol.cmp(&b.signal.symbol))
        });
        all
    }

    /// Realised volatility aggregated over every known symbol.
    pub fn market_risk(&self) -> MarketRisk {
        let symbols = self.symbols();
        let volatilities: Vec<f64> = symbols
            .iter()
            .filter_map(|s| {
                let snapshot = self.indicators.latest(s);
                indicator_value(&self.config.indicators, snapshot.as_ref(), is_volatility)
            })
            .collect();
        MarketRisk::from_volatilities(&volatilities, symbols.len())
    }

    pub fn latest_forecast(&self, symbol: &str) -> Option<Forecast> {
        if let Some(CachedValue::Forecast(f)) = self.scheduler.get_cached(symbol, CacheKind::Forecast) {
            return Some((*f).clone());
        }
        self.forecasts.latest(symbol)
    }

    pub fn latest_indicators(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        self.indicators.latest(symbol)
    }

    pub fn sentiment_now(&self, symbol: &str) -> Option<SentimentScore> {
        self.sentiment.score_at(symbol, self.watermark())
    }

    /// Structured brief of the latest signal for the narrative collaborator.
    pub fn narrative(&self, symbol: &str) -> Option<NarrativeBrief> {
        let signal = self.latest_signal(symbol)?;
        Some(NarrativeBrief::from_parts(BriefParts {
            signal: &signal,
            forecast: self.forecasts.latest_as_of(symbol, signal.timestamp).as_ref(),
            sentiment: self.sentiment.score_at(symbol, signal.timestamp).as_ref(),
            indicators: self.indicators.latest_as_of(symbol, signal.timestamp).as_ref(),
            indicator_specs: &self.config.indicators,
            last_price: self.history.last_as_of(symbol, signal.timestamp),
            change_pct: self.history.change_pct(symbol),
        }))
    }

    pub fn ingest_stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            received: c.received.load(Ordering::Relaxed),
            market_released: c.market_released.load(Ordering::Relaxed),
            news_accepted: c.news_accepted.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            late: c.late.load(Ordering::Relaxed),
            unscoreable: c.unscoreable.load(Ordering::Relaxed),
            retrain_failures: c.retrain_failures.load(Ordering::Relaxed),
        }
    }

    pub fn recent_warnings(&self) -> Vec<WarningRecord> {
        self.recent_warnings.read().iter().cloned().collect()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state_version: self.current_state_version(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            watermark: self.watermark(),
            symbols: self.symbols(),
            ingest: self.ingest_stats(),
            scheduler: self.scheduler.stats(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, SourceKind};

    const MIN: i64 = 60_000;
    const T0: i64 = 1_700_000_000_000;

    fn engine(tolerance_ms: i64) -> SynthesisEngine {
        let mut cfg = EngineConfig::default();
        cfg.normalizer.out_of_order_tolerance_ms = tolerance_ms;
        SynthesisEngine::new(cfg).unwrap()
    }

    fn tick_line(symbol: &str, ts: i64, price: f64) -> String {
        format!(r#"{{"kind":"tick","symbol":"{symbol}","timestamp":{ts},"price":{price},"volume":10}}"#)
    }

    fn news_line(id: &str, symbol: &str, ts: i64, polarity: f64) -> String {
        format!(
            r#"{{"kind":"news","id":"{id}","symbols":["{symbol}"],"timestamp":{ts},"polarity":{polarity},"source":"wire"}}"#
        )
    }

    /// A gently trending series with noise-like wiggle.
    fn price_at(i: usize) -> f64 {
        100.0 + i as f64 * 0.08 + (i as f64 * 0.9).sin() * 0.4
    }

    fn feed(engine: &SynthesisEngine, n: usize) {
        for i in 0..n {
            let ts = T0 + i as i64 * MIN;
            engine.ingest_line(&tick_line("AAPL", ts, price_at(i))).unwrap();
            if i % 25 == 0 {
                engine
                    .ingest_line(&news_line(&format!("n{i}"), "AAPL", ts, 0.4))
                    .unwrap();
            }
        }
        engine.flush_all();
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut cfg = EngineConfig::default();
        cfg.synthesis.base_weights.indicator = f64::NAN;
        assert!(SynthesisEngine::new(cfg).is_err());
    }

    #[test]
    fn replay_is_deterministic() {
        let a = engine(2_000);
        let b = engine(2_000);
        for e in [&a, &b] {
            feed(e, 200);
            e.retrain("AAPL").unwrap();
        }
        let sa = a.synthesize_now("AAPL");
        let sb = b.synthesize_now("AAPL");
        assert_eq!(sa, sb);
        assert_eq!(sa.confidence.to_bits(), sb.confidence.to_bits());
        assert_eq!(sa.factors.len(), 3);
        assert!(sa.factors.iter().all(|f| f.available));
        assert!(!sa.degraded);
    }

    #[test]
    fn unknown_symbol_is_degraded_flat() {
        let e = engine(0);
        feed(&e, 10);
        let s = e.synthesize_now("ZZZZ");
        assert!(s.degraded);
        assert_eq!(s.direction, Direction::Flat);
        assert!(s.confidence <= e.config().synthesis.confidence_floor);
    }

    #[test]
    fn late_event_within_tolerance_matches_in_order_stream() {
        let ordered = engine(2 * MIN);
        let shuffled = engine(2 * MIN);
        let n = 60;
        for i in 0..n {
            ordered
                .ingest_line(&tick_line("AAPL", T0 + i as i64 * MIN, price_at(i)))
                .unwrap();
        }
        // Swap every adjacent pair: each second event arrives one minute late.
        for pair in (0..n).collect::<Vec<_>>().chunks(2) {
            for &i in pair.iter().rev() {
                shuffled
                    .ingest_line(&tick_line("AAPL", T0 + i as i64 * MIN, price_at(i)))
                    .unwrap();
            }
        }
        ordered.flush_all();
        shuffled.flush_all();
        assert_eq!(
            ordered.latest_indicators("AAPL"),
            shuffled.latest_indicators("AAPL")
        );
        assert_eq!(shuffled.ingest_stats().late, 0);
    }

    #[test]
    fn late_event_beyond_tolerance_changes_nothing() {
        let e = engine(1_000);
        for i in 0..30 {
            e.ingest_line(&tick_line("AAPL", T0 + i * MIN, 100.0 + i as f64))
                .unwrap();
        }
        let before = e.latest_indicators("AAPL");
        let history_before = e.history().count("AAPL");

        let err = e
            .ingest_line(&tick_line("AAPL", T0 + 5 * MIN, 50.0))
            .unwrap_err();
        assert_eq!(err.code(), "LATE");
        assert_eq!(e.latest_indicators("AAPL"), before);
        assert_eq!(e.history().count("AAPL"), history_before);
        assert_eq!(e.ingest_stats().late, 1);
        assert_eq!(e.recent_warnings()[0].code, "LATE");
    }

    #[test]
    fn synthesis_at_earlier_time_ignores_later_news() {
        let e = engine(0);
        for i in 0..40 {
            e.ingest_line(&tick_line("AAPL", T0 + i as i64 * MIN, price_at(i)))
                .unwrap();
        }
        e.ingest_line(&news_line("early", "AAPL", T0 + 20 * MIN, 0.5))
            .unwrap();
        let as_of = T0 + 39 * MIN;
        let before = e.synthesize_at("AAPL", as_of);

        for k in 0..5 {
            e.ingest_line(&news_line(&format!("late{k}"), "AAPL", T0 + 69 * MIN, -1.0))
                .unwrap();
        }
        let after = e.synthesize_at("AAPL", as_of);
        assert_eq!(before, after);

        let sentiment = after
            .factors
            .iter()
            .find(|f| f.source == SourceKind::Sentiment)
            .unwrap();
        assert!(sentiment.available);
        assert_eq!(sentiment.direction, Direction::Long);
        assert_eq!(sentiment.age_ms, Some(19 * MIN));
    }

    #[test]
    fn late_news_mention_is_counted_and_warned() {
        let e = engine(MIN);
        e.ingest_line(&news_line("fresh", "AAPL", T0 + 30 * MIN, 0.3))
            .unwrap();
        let out = e
            .ingest_line(&format!(
                r#"{{"kind":"news","id":"mixed","symbols":["AAPL","MSFT"],"timestamp":{},"polarity":0.5}}"#,
                T0
            ))
            .unwrap();
        assert_eq!(SynthesisEngine::touched_symbols(&out), vec!["MSFT".to_string()]);

        let stats = e.ingest_stats();
        assert_eq!(stats.news_accepted, 2);
        assert_eq!(stats.late, 1);
        let warnings = e.recent_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, "LATE");
        assert_eq!(warnings[0].symbol.as_deref(), Some("AAPL"));
    }

    #[test]
    fn synthesis_in_the_past_uses_inputs_in_force_then() {
        let e = engine(0);
        feed(&e, 80);
        e.retrain("AAPL").unwrap();
        let past = T0 + 60 * MIN;
        let s = e.synthesize_at("AAPL", past);

        let indicator = s
            .factors
            .iter()
            .find(|f| f.source == SourceKind::Indicator)
            .unwrap();
        assert!(indicator.available);
        assert_eq!(indicator.age_ms, Some(0));
        // The only forecast was projected from the newest price.
        let forecast = s
            .factors
            .iter()
            .find(|f| f.source == SourceKind::Forecast)
            .unwrap();
        assert!(!forecast.available);
    }

    #[test]
    fn retrain_failure_keeps_previous_model_and_is_recorded() {
        let e = engine(0);
        feed(&e, 10);
        assert!(matches!(
            e.retrain("AAPL"),
            Err(RetrainError::InsufficientHistory { .. })
        ));
        assert_eq!(e.forecasts().current_version("AAPL"), 0);
        assert_eq!(e.ingest_stats().retrain_failures, 1);
    }

    #[test]
    fn malformed_lines_are_counted_not_fatal() {
        let e = engine(0);
        assert!(e.ingest_line("{broken").is_err());
        assert!(e.ingest_line(&tick_line("AAPL", T0, -1.0)).is_err());
        assert!(e.ingest_line(&tick_line("AAPL", T0, 1.0)).is_ok());
        let stats = e.ingest_stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.market_released, 1);
    }

    #[test]
    fn ranked_signals_order_by_confidence() {
        let e = engine(0);
        feed(&e, 120);
        e.retrain("AAPL").unwrap();
        e.synthesize_now("AAPL");
        e.synthesize_now("MSFT");
        let ranked = e.ranked_signals();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].signal.symbol, "AAPL");
        assert!(ranked[0].signal.confidence >= ranked[1].signal.confidence);
        assert_ne!(ranked[0].risk_level, crate::narrative::RiskLevel::Unknown);
        assert!(ranked[0].volume_ratio.is_some());
        assert_eq!(ranked[1].risk_level, crate::narrative::RiskLevel::Unknown);

        let brief = e.narrative("AAPL").unwrap();
        assert!(brief.risk.is_some());
        // Constant tick volume.
        assert_eq!(brief.volume.map(|v| v.unusual), Some(false));

        let risk = e.market_risk();
        assert_eq!(risk.market_count, e.symbols().len());
        assert!(risk.average_volatility > 0.0);
    }

    #[tokio::test]
    async fn concurrent_signal_requests_coalesce() {
        let e = Arc::new(engine(0));
        feed(&e, 80);
        let (a, b) = tokio::join!(e.signal("AAPL"), e.signal("AAPL"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(e.scheduler().stats().computations, 1);

        // Cached until the next event.
        let c = e.signal("AAPL").await;
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(e.recent_signals("AAPL").len(), 1);
        e.ingest_line(&tick_line("AAPL", T0 + 500 * MIN, 140.0)).unwrap();
        let d = e.signal("AAPL").await;
        assert!(!Arc::ptr_eq(&a, &d));
        assert_eq!(e.recent_signals("AAPL").len(), 2);
    }

    #[tokio::test]
    async fn slow_forecast_refresh_falls_back_to_stale_forecast() {
        let mut cfg = EngineConfig::default();
        cfg.normalizer.out_of_order_tolerance_ms = 0;
        cfg.forecast.deadline_ms = 1;
        cfg.synthesis.max_age_ms.forecast = 2 * MIN;
        let e = Arc::new(SynthesisEngine::new(cfg).unwrap());
        feed(&e, 80);
        e.retrain("AAPL").unwrap();
        let stale_as_of = e.latest_forecast("AAPL").unwrap().as_of;
        e.ingest_line(&tick_line("AAPL", T0 + 85 * MIN, price_at(85)))
            .unwrap();

        // A retrain holds the symbol while the refresh is attempted.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let e = e.clone();
            std::thread::spawn(move || {
                e.forecasts().hold_retrain_lock("AAPL", || {
                    locked_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(300));
                })
            })
        };
        locked_rx.recv().unwrap();

        let signal = e.signal("AAPL").await;
        assert_eq!(e.scheduler().stats().deadline_misses, 1);
        let forecast = signal
            .factors
            .iter()
            .find(|f| f.source == SourceKind::Forecast)
            .unwrap();
        assert!(forecast.available);
        assert_eq!(forecast.age_ms, Some(T0 + 85 * MIN - stale_as_of));
        // 0.5^((6 - 2) / 2)
        assert!((forecast.staleness_discount - 0.25).abs() < 1e-12);

        // The refresh still lands once the lock is released.
        holder.join().unwrap();
        for _ in 0..200 {
            if e.forecasts().latest("AAPL").map(|f| f.as_of) == Some(T0 + 85 * MIN) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(e.forecasts().latest("AAPL").map(|f| f.as_of), Some(T0 + 85 * MIN));
    }

    #[tokio::test]
    async fn ingest_worker_drains_channel_and_flushes() {
        let e = Arc::new(engine(5 * MIN));
        let (tx, rx) = mpsc::channel(16);
        let worker = tokio::spawn(e.clone().run_ingest(rx));
        for i in 0..5 {
            tx.send(FeedLine {
                feed: "market".into(),
                line: tick_line("TSLA", T0 + i * MIN, 200.0),
            })
            .await
            .unwrap();
        }
        drop(tx);
        worker.await.unwrap();
        assert_eq!(e.history().count("TSLA"), 5);
        assert_eq!(e.ingest_stats().market_released, 5);
    }
}
