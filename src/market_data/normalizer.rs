// =============================================================================
// Data Normalizer -- one entry point from raw feed JSON to ordered events
// =============================================================================
//
// Raw feed lines are parsed into a tagged `RawEvent`, validated, and routed:
//
//   * price events (bars and ticks) go through a per-symbol reorder buffer.
//     `max_seen` is the newest timestamp seen for the symbol and the
//     watermark is `max_seen - tolerance`. Events are held until they fall
//     at or below the watermark and are then released in timestamp order.
//     Anything more than `tolerance` behind `max_seen` is rejected as late.
//   * an exact (symbol, timestamp) seen before, held or recently released,
//     is a duplicate no-op, even when it would also be late.
//   * news events are released immediately. Each mention is checked against
//     the symbol's news watermark with the same tolerance; late mentions are
//     dropped and handed back alongside the accepted event.
//
// Rejections are returned as `IngestError` values; nothing here panics.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::DateTime;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::arena::SymbolArena;
use crate::error::IngestError;
use crate::sentiment::PolarityScorer;
use crate::types::{normalize_symbol, MarketEvent, Mention, NewsEvent, Timestamp};

/// News ids remembered for duplicate suppression.
const SEEN_NEWS_CAPACITY: usize = 4_096;

/// Released price timestamps remembered per symbol for duplicate suppression.
const RELEASED_MEMORY: usize = 4_096;

// ---------------------------------------------------------------------------
// Raw events
// ---------------------------------------------------------------------------

/// A feed record before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Bar {
        symbol: String,
        timestamp: Timestamp,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    },
    Tick {
        symbol: String,
        timestamp: Timestamp,
        price: f64,
        volume: f64,
    },
    News {
        id: Option<String>,
        timestamp: Timestamp,
        symbols: Vec<String>,
        /// Per-symbol relevance; symbols not listed get 1.0.
        relevance: BTreeMap<String, f64>,
        polarity: Option<f64>,
        text: Option<String>,
        source: Option<String>,
        source_weight: Option<f64>,
    },
}

impl RawEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bar { .. } => "bar",
            Self::Tick { .. } => "tick",
            Self::News { .. } => "news",
        }
    }
}

/// Outcome of a successful ingest.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// Price events released by this ingest, in timestamp order. Empty while
    /// the new event is still held back.
    Market(Vec<MarketEvent>),
    /// An accepted news event, plus one `Late` error per mention dropped
    /// from it.
    News {
        event: NewsEvent,
        late: Vec<IngestError>,
    },
    NoOp(NoOpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Same symbol and timestamp (or same news id) as an earlier event.
    Duplicate,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn malformed(msg: impl Into<String>) -> IngestError {
    IngestError::Malformed(msg.into())
}

/// Feeds send numbers either as JSON numbers or as strings.
fn parse_string_f64(val: &Value, name: &str) -> Result<f64, IngestError> {
    match val {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| malformed(format!("failed to parse {name} as f64: {s}"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| malformed(format!("field {name} is not a valid f64"))),
        Value::Null => Err(malformed(format!("missing field {name}"))),
        _ => Err(malformed(format!("field {name} has unexpected JSON type"))),
    }
}

fn parse_optional_f64(val: &Value, name: &str) -> Result<Option<f64>, IngestError> {
    match val {
        Value::Null => Ok(None),
        other => parse_string_f64(other, name).map(Some),
    }
}

/// Epoch milliseconds as a number, a numeric string, or an RFC 3339 string.
fn parse_timestamp(val: &Value) -> Result<Timestamp, IngestError> {
    match val {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or_else(|| malformed("timestamp is not an integer")),
        Value::String(s) => {
            if let Ok(ms) = s.trim().parse::<i64>() {
                return Ok(ms);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.timestamp_millis())
                .map_err(|_| malformed(format!("unparseable timestamp: {s}")))
        }
        Value::Null => Err(malformed("missing field timestamp")),
        _ => Err(malformed("timestamp has unexpected JSON type")),
    }
}

fn parse_symbol(val: &Value) -> Result<String, IngestError> {
    val.as_str()
        .map(str::to_string)
        .ok_or_else(|| malformed("missing field symbol"))
}

fn parse_optional_str(val: &Value) -> Option<String> {
    val.as_str().map(str::to_string)
}

/// Parse one JSON feed line into a `RawEvent`.
///
/// Accepted shapes:
/// ```json
/// {"kind":"bar","symbol":"AAPL","timestamp":1700000000000,"open":"189.1","high":190,"low":188.7,"close":189.9,"volume":1200}
/// {"kind":"tick","symbol":"AAPL","timestamp":1700000000000,"price":189.9,"volume":10}
/// {"kind":"news","symbols":["AAPL"],"timestamp":"2023-11-14T22:13:20Z","polarity":0.4,"source":"wire"}
/// ```
pub fn parse_raw_line(line: &str) -> Result<RawEvent, IngestError> {
    let root: Value =
        serde_json::from_str(line).map_err(|e| malformed(format!("invalid JSON: {e}")))?;

    let kind = root["kind"]
        .as_str()
        .ok_or_else(|| malformed("missing field kind"))?;

    match kind {
        "bar" => Ok(RawEvent::Bar {
            symbol: parse_symbol(&root["symbol"])?,
            timestamp: parse_timestamp(&root["timestamp"])?,
            open: parse_string_f64(&root["open"], "open")?,
            high: parse_string_f64(&root["high"], "high")?,
            low: parse_string_f64(&root["low"], "low")?,
            close: parse_string_f64(&root["close"], "close")?,
            volume: parse_optional_f64(&root["volume"], "volume")?.unwrap_or(0.0),
        }),
        "tick" => Ok(RawEvent::Tick {
            symbol: parse_symbol(&root["symbol"])?,
            timestamp: parse_timestamp(&root["timestamp"])?,
            price: parse_string_f64(&root["price"], "price")?,
            volume: parse_optional_f64(&root["volume"], "volume")?.unwrap_or(0.0),
        }),
        "news" => {
            let symbols = match &root["symbols"] {
                Value::Array(items) => items
                    .iter()
                    .map(|s| {
                        s.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| malformed("symbols must be strings"))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                Value::Null => match &root["symbol"] {
                    Value::String(s) => vec![s.clone()],
                    _ => return Err(malformed("missing field symbols")),
                },
                _ => return Err(malformed("symbols must be an array")),
            };

            let mut relevance = BTreeMap::new();
            if let Value::Object(map) = &root["relevance"] {
                for (sym, w) in map {
                    let w = parse_string_f64(w, &format!("relevance.{sym}"))?;
                    relevance.insert(normalize_symbol(sym), w);
                }
            }

            Ok(RawEvent::News {
                id: parse_optional_str(&root["id"]),
                timestamp: parse_timestamp(&root["timestamp"])?,
                symbols,
                relevance,
                polarity: parse_optional_f64(&root["polarity"], "polarity")?,
                text: parse_optional_str(&root["text"]),
                source: parse_optional_str(&root["source"]),
                source_weight: parse_optional_f64(&root["source_weight"], "source_weight")?,
            })
        }
        other => Err(malformed(format!("unknown event kind {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_symbol(raw: &str) -> Result<String, IngestError> {
    let symbol = normalize_symbol(raw);
    if symbol.is_empty() {
        return Err(malformed("empty symbol"));
    }
    Ok(symbol)
}

fn check_timestamp(ts: Timestamp) -> Result<(), IngestError> {
    if ts <= 0 {
        return Err(malformed(format!("non-positive timestamp {ts}")));
    }
    Ok(())
}

fn check_price(name: &str, value: f64) -> Result<(), IngestError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(malformed(format!("{name} must be finite and positive, got {value}")));
    }
    Ok(())
}

fn check_unit(name: &str, value: f64) -> Result<(), IngestError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(malformed(format!("{name} must be in [0, 1], got {value}")));
    }
    Ok(())
}

fn validate_market(raw: RawEvent) -> Result<MarketEvent, IngestError> {
    let (symbol, timestamp, price, volume) = match raw {
        RawEvent::Bar {
            symbol,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        } => {
            check_price("open", open)?;
            check_price("high", high)?;
            check_price("low", low)?;
            check_price("close", close)?;
            if low > high {
                return Err(malformed(format!("low {low} above high {high}")));
            }
            (symbol, timestamp, close, volume)
        }
        RawEvent::Tick {
            symbol,
            timestamp,
            price,
            volume,
        } => {
            check_price("price", price)?;
            (symbol, timestamp, price, volume)
        }
        RawEvent::News { .. } => return Err(malformed("news routed as market event")),
    };

    let symbol = check_symbol(&symbol)?;
    check_timestamp(timestamp)?;
    if !volume.is_finite() || volume < 0.0 {
        return Err(malformed(format!("volume must be finite and non-negative, got {volume}")));
    }

    Ok(MarketEvent {
        symbol,
        timestamp,
        price,
        volume,
    })
}

// ---------------------------------------------------------------------------
// Per-symbol stream state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SymbolStream {
    max_seen: Option<Timestamp>,
    /// Held-back price events keyed by timestamp.
    pending: BTreeMap<Timestamp, MarketEvent>,
    last_released: Option<Timestamp>,
    /// Most recent released timestamps, bounded by `RELEASED_MEMORY`.
    released: BTreeSet<Timestamp>,
    news_max_seen: Option<Timestamp>,
}

impl SymbolStream {
    fn release_through(&mut self, watermark: Timestamp) -> Vec<MarketEvent> {
        let keep = match watermark.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        let released = std::mem::replace(&mut self.pending, keep);
        if let Some((&ts, _)) = released.iter().next_back() {
            self.last_released = Some(ts);
        }
        for &ts in released.keys() {
            self.remember_released(ts);
        }
        released.into_values().collect()
    }

    fn remember_released(&mut self, ts: Timestamp) {
        self.released.insert(ts);
        while self.released.len() > RELEASED_MEMORY {
            self.released.pop_first();
        }
    }

    fn is_duplicate(&self, ts: Timestamp) -> bool {
        self.pending.contains_key(&ts) || self.released.contains(&ts)
    }
}

/// Bounded memory of recently seen news ids.
#[derive(Debug, Default)]
struct SeenNews {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenNews {
    /// Returns false if `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > SEEN_NEWS_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// DataNormalizer
// ---------------------------------------------------------------------------

/// Validates raw events and releases them in per-symbol timestamp order.
pub struct DataNormalizer {
    tolerance_ms: i64,
    streams: SymbolArena<SymbolStream>,
    seen_news: Mutex<SeenNews>,
    scorer: Arc<dyn PolarityScorer>,
    /// Newest event time seen on any stream.
    global_max_seen: AtomicI64,
}

impl DataNormalizer {
    pub fn new(tolerance_ms: i64, scorer: Arc<dyn PolarityScorer>) -> Self {
        Self {
            tolerance_ms: tolerance_ms.max(0),
            streams: SymbolArena::new(),
            seen_news: Mutex::new(SeenNews::default()),
            scorer,
            global_max_seen: AtomicI64::new(0),
        }
    }

    pub fn tolerance_ms(&self) -> i64 {
        self.tolerance_ms
    }

    /// Parse and ingest one feed line.
    pub fn ingest_line(&self, line: &str) -> Result<Normalized, IngestError> {
        self.ingest(parse_raw_line(line)?)
    }

    /// Validate `raw` and release whatever it makes releasable.
    pub fn ingest(&self, raw: RawEvent) -> Result<Normalized, IngestError> {
        match raw {
            RawEvent::News { .. } => self.ingest_news(raw),
            market => self.ingest_market(validate_market(market)?),
        }
    }

    fn advance_global(&self, ts: Timestamp) {
        self.global_max_seen.fetch_max(ts, Ordering::AcqRel);
    }

    fn ingest_market(&self, event: MarketEvent) -> Result<Normalized, IngestError> {
        let tolerance = self.tolerance_ms;
        let symbol = event.symbol.clone();
        let ts = event.timestamp;

        let outcome = self.streams.with(&symbol, SymbolStream::default, |stream| {
            if stream.is_duplicate(ts) {
                return Ok(Normalized::NoOp(NoOpReason::Duplicate));
            }
            if let Some(max_seen) = stream.max_seen {
                let lag = max_seen - ts;
                let behind_released = stream.last_released.map_or(false, |r| ts < r);
                if lag > tolerance || behind_released {
                    return Err(IngestError::Late {
                        symbol: symbol.clone(),
                        timestamp: ts,
                        max_seen,
                        lag_ms: lag,
                        tolerance_ms: tolerance,
                    });
                }
            }

            stream.pending.insert(ts, event);
            let max_seen = stream.max_seen.map_or(ts, |m| m.max(ts));
            stream.max_seen = Some(max_seen);
            Ok(Normalized::Market(stream.release_through(max_seen - tolerance)))
        })?;

        self.advance_global(ts);
        if let Normalized::Market(released) = &outcome {
            trace!(symbol = %symbol, ts, released = released.len(), "market event normalized");
        }
        Ok(outcome)
    }

    fn ingest_news(&self, raw: RawEvent) -> Result<Normalized, IngestError> {
        let RawEvent::News {
            id,
            timestamp,
            symbols,
            relevance,
            polarity,
            text,
            source,
            source_weight,
        } = raw
        else {
            return Err(malformed("market event routed as news"));
        };

        check_timestamp(timestamp)?;
        if symbols.is_empty() {
            return Err(malformed("news event mentions no symbols"));
        }
        let source_weight = source_weight.unwrap_or(1.0);
        check_unit("source_weight", source_weight)?;

        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let polarity = match polarity {
            Some(p) => {
                if !p.is_finite() || !(-1.0..=1.0).contains(&p) {
                    return Err(malformed(format!("polarity must be in [-1, 1], got {p}")));
                }
                p
            }
            None => text
                .as_deref()
                .and_then(|t| self.scorer.score(t))
                .ok_or_else(|| IngestError::Unscoreable { id: id.clone() })?,
        };

        let mut mentions: Vec<Mention> = Vec::with_capacity(symbols.len());
        for raw_symbol in &symbols {
            let symbol = check_symbol(raw_symbol)?;
            if mentions.iter().any(|m| m.symbol == symbol) {
                continue;
            }
            let rel = relevance.get(&symbol).copied().unwrap_or(1.0);
            check_unit("relevance", rel)?;
            mentions.push(Mention {
                symbol,
                relevance: rel,
            });
        }

        if !self.seen_news.lock().insert(&id) {
            return Ok(Normalized::NoOp(NoOpReason::Duplicate));
        }

        let tolerance = self.tolerance_ms;
        let mut late: Vec<IngestError> = Vec::new();
        mentions.retain(|m| {
            self.streams.with(&m.symbol, SymbolStream::default, |stream| {
                if let Some(max_seen) = stream.news_max_seen {
                    let lag = max_seen - timestamp;
                    if lag > tolerance {
                        late.push(IngestError::Late {
                            symbol: m.symbol.clone(),
                            timestamp,
                            max_seen,
                            lag_ms: lag,
                            tolerance_ms: tolerance,
                        });
                        return false;
                    }
                }
                stream.news_max_seen = Some(stream.news_max_seen.map_or(timestamp, |n| n.max(timestamp)));
                true
            })
        });

        if mentions.is_empty() {
            return Err(late
                .into_iter()
                .next()
                .unwrap_or_else(|| malformed("news event has no usable mentions")));
        }

        self.advance_global(timestamp);

        Ok(Normalized::News {
            event: NewsEvent {
                id,
                timestamp,
                mentions,
                polarity,
                source: source.unwrap_or_else(|| "unknown".to_string()),
                source_weight,
            },
            late,
        })
    }

    /// Release every held event for `symbol` regardless of the watermark.
    pub fn flush(&self, symbol: &str) -> Vec<MarketEvent> {
        match self.streams.get(symbol) {
            Some(slot) => slot.lock().release_through(Timestamp::MAX),
            None => Vec::new(),
        }
    }

    /// Flush every symbol, in symbol order.
    pub fn flush_all(&self) -> Vec<MarketEvent> {
        self.streams
            .symbols()
            .into_iter()
            .flat_map(|sym| self.flush(&sym))
            .collect()
    }

    /// `max_seen - tolerance` for `symbol`'s price stream.
    pub fn watermark(&self, symbol: &str) -> Option<Timestamp> {
        let slot = self.streams.get(symbol)?;
        let stream = slot.lock();
        stream.max_seen.map(|m| m - self.tolerance_ms)
    }

    /// Newest event time seen on any stream; zero before the first event.
    pub fn global_watermark(&self) -> Timestamp {
        self.global_max_seen.load(Ordering::Acquire)
    }

    /// Number of price events currently held back for `symbol`.
    pub fn pending(&self, symbol: &str) -> usize {
        self.streams
            .get(symbol)
            .map_or(0, |slot| slot.lock().pending.len())
    }

    /// Seed the per-symbol price watermark after a restart so that replayed
    /// history older than the restored state is rejected as late.
    pub fn restore_watermark(&self, symbol: &str, last_released: Timestamp) {
        self.streams.with(symbol, SymbolStream::default, |stream| {
            stream.max_seen = Some(stream.max_seen.map_or(last_released, |m| m.max(last_released)));
            stream.last_released = Some(stream.last_released.map_or(last_released, |r| r.max(last_released)));
            stream.remember_released(last_released);
        });
        self.advance_global(last_released);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
