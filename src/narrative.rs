// =============================================================================
// Narrative Brief -- headline numbers behind a signal
// =============================================================================
//
// Structured summary handed to whatever writes prose about a signal. Every
// field is derived from engine state; nothing downstream of the brief feeds
// back into synthesis.
//
// Risk reads the realised volatility indicator: above 0.03 is HIGH, above
// 0.02 MEDIUM, anything else LOW. Volume above 1.2x its rolling mean is
// flagged unusual. The same readings annotate the ranked signal list and,
// aggregated across symbols, the market risk summary.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

use crate::forecast::Forecast;
use crate::indicators::rsi::rsi_label;
use crate::indicators::volume::UNUSUAL_VOLUME_RATIO;
use crate::indicators::{IndicatorSnapshot, IndicatorSpec};
use crate::market_data::PricePoint;
use crate::sentiment::SentimentScore;
use crate::signals::{Factor, Signal};
use crate::types::{Direction, Timestamp};

/// Sentiment scores inside this band read as NEUTRAL.
const SENTIMENT_LABEL_BAND: f64 = 0.1;

const HIGH_RISK_VOLATILITY: f64 = 0.03;
const MEDIUM_RISK_VOLATILITY: f64 = 0.02;
/// Symbols above this count toward `MarketRisk::high_volatility_count`.
const HIGH_VOLATILITY: f64 = 0.025;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    /// No volatility reading yet.
    Unknown,
}

pub fn risk_level(volatility: f64) -> RiskLevel {
    if volatility > HIGH_RISK_VOLATILITY {
        RiskLevel::High
    } else if volatility > MEDIUM_RISK_VOLATILITY {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Borrowed inputs for [`NarrativeBrief::from_parts`].
pub struct BriefParts<'a> {
    pub signal: &'a Signal,
    pub forecast: Option<&'a Forecast>,
    pub sentiment: Option<&'a SentimentScore>,
    pub indicators: Option<&'a IndicatorSnapshot>,
    pub indicator_specs: &'a BTreeMap<String, IndicatorSpec>,
    pub last_price: Option<PricePoint>,
    pub change_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastBrief {
    pub horizon_ms: i64,
    pub point: f64,
    /// Expected return as a percentage of the base price.
    pub return_pct: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
    pub model_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentimentBrief {
    pub score: f64,
    /// "POSITIVE" / "NEGATIVE" / "NEUTRAL".
    pub label: &'static str,
    pub confidence: f64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskBrief {
    /// Realised volatility of log returns.
    pub volatility: f64,
    pub level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeBrief {
    /// Last volume over its rolling mean.
    pub ratio: f64,
    pub unusual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NarrativeBrief {
    pub symbol: String,
    pub timestamp: Timestamp,
    /// One-line summary, e.g. "AAPL LONG (confidence 62%)".
    pub headline: String,
    pub direction: Direction,
    pub confidence: f64,
    pub degraded: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_pct: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_label: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_histogram: Option<f64>,
    /// "BULLISH" when the histogram is positive, else "BEARISH".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_trend: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskBrief>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeBrief>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<ForecastBrief>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<SentimentBrief>,

    pub factors: Vec<Factor>,
}

/// One entry of the ranked signal list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedSignal {
    #[serde(flatten)]
    pub signal: Signal,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volatility: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ratio: Option<f64>,
    pub unusual_volume: bool,
}

impl RankedSignal {
    pub fn new(signal: Signal, volatility: Option<f64>, volume_ratio: Option<f64>) -> Self {
        Self {
            signal,
            risk_level: volatility.map_or(RiskLevel::Unknown, risk_level),
            volatility,
            volume_ratio,
            unusual_volume: volume_ratio.map_or(false, |r| r > UNUSUAL_VOLUME_RATIO),
        }
    }
}

/// Volatility aggregated across every symbol with a reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketRisk {
    pub average_volatility: f64,
    pub maximum_volatility: f64,
    pub risk_level: RiskLevel,
    /// Symbols known to the engine, with or without a reading.
    pub market_count: usize,
    pub high_volatility_count: usize,
}

impl MarketRisk {
    pub fn from_volatilities(volatilities: &[f64], market_count: usize) -> Self {
        let readings: Vec<f64> = volatilities.iter().copied().filter(|v| *v > 0.0).collect();
        if readings.is_empty() {
            return Self {
                average_volatility: 0.0,
                maximum_volatility: 0.0,
                risk_level: RiskLevel::Unknown,
                market_count,
                high_volatility_count: 0,
            };
        }
        let average = readings.iter().sum::<f64>() / readings.len() as f64;
        Self {
            average_volatility: average,
            maximum_volatility: readings.iter().copied().fold(f64::MIN, f64::max),
            risk_level: risk_level(average),
            market_count,
            high_volatility_count: readings.iter().filter(|v| **v > HIGH_VOLATILITY).count(),
        }
    }
}

/// Name of the first configured indicator matching `pred`.
fn find_indicator<'a>(
    specs: &'a BTreeMap<String, IndicatorSpec>,
    pred: impl Fn(&IndicatorSpec) -> bool,
) -> Option<&'a str> {
    specs
        .iter()
        .find(|(_, spec)| pred(spec))
        .map(|(name, _)| name.as_str())
}

/// Ready value of the first configured indicator matching `pred`.
pub fn indicator_value(
    specs: &BTreeMap<String, IndicatorSpec>,
    snapshot: Option<&IndicatorSnapshot>,
    pred: impl Fn(&IndicatorSpec) -> bool,
) -> Option<f64> {
    let name = find_indicator(specs, pred)?;
    snapshot?.value(name)
}

pub fn is_volatility(spec: &IndicatorSpec) -> bool {
    matches!(spec, IndicatorSpec::Volatility { .. })
}

pub fn is_volume_ratio(spec: &IndicatorSpec) -> bool {
    matches!(spec, IndicatorSpec::VolumeRatio { .. })
}

fn sentiment_label(score: f64) -> &'static str {
    if score >= SENTIMENT_LABEL_BAND {
        "POSITIVE"
    } else if score <= -SENTIMENT_LABEL_BAND {
        "NEGATIVE"
    } else {
        "NEUTRAL"
    }
}

impl NarrativeBrief {
    pub fn from_parts(parts: BriefParts<'_>) -> Self {
        let signal = parts.signal;

        let reading = |pred: fn(&IndicatorSpec) -> bool| -> Option<f64> {
            indicator_value(parts.indicator_specs, parts.indicators, pred)
        };
        let rsi = reading(|s| matches!(s, IndicatorSpec::Rsi { .. }));
        let macd_histogram = reading(|s| matches!(s, IndicatorSpec::Macd { .. }));
        let risk = reading(is_volatility).map(|volatility| RiskBrief {
            volatility,
            level: risk_level(volatility),
        });
        let volume = reading(is_volume_ratio).map(|ratio| VolumeBrief {
            ratio,
            unusual: ratio > UNUSUAL_VOLUME_RATIO,
        });

        let forecast = parts.forecast.map(|f| ForecastBrief {
            horizon_ms: f.horizon_ms,
            point: f.point,
            return_pct: f.expected_return() * 100.0,
            lower: f.lower,
            upper: f.upper,
            confidence: f.confidence,
            model_version: f.model_version,
        });

        let sentiment = parts.sentiment.map(|s| SentimentBrief {
            score: s.score,
            label: sentiment_label(s.score),
            confidence: s.confidence,
            sample_count: s.sample_count,
        });

        let mut headline = format!(
            "{} {} (confidence {:.0}%)",
            signal.symbol,
            signal.direction,
            signal.confidence * 100.0
        );
        if signal.degraded {
            headline.push_str(" -- degraded, no fresh inputs");
        }

        Self {
            symbol: signal.symbol.clone(),
            timestamp: signal.timestamp,
            headline,
            direction: signal.direction,
            confidence: signal.confidence,
            degraded: signal.degraded,
            last_price: parts.last_price.map(|p| p.price),
            change_pct: parts.change_pct,
            rsi,
            rsi_label: rsi.map(rsi_label),
            macd_histogram,
            macd_trend: macd_histogram.map(|h| if h > 0.0 { "BULLISH" } else { "BEARISH" }),
            risk,
            volume,
            forecast,
            sentiment,
            factors: signal.factors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{default_indicators, IndicatorReading};

    fn signal(direction: Direction, confidence: f64, degraded: bool) -> Signal {
        Signal {
            symbol: "AAPL".into(),
            timestamp: 1_000,
            direction,
            strength: 0.5,
            confidence,
            net_score: 0.3,
            agreement: 1.0,
            degraded,
            factors: Vec::new(),
        }
    }

    fn snapshot(rsi: f64, hist: f64) -> IndicatorSnapshot {
        let mut values = BTreeMap::new();
        values.insert("rsi_14".to_string(), IndicatorReading::Ready { value: rsi });
        values.insert("macd".to_string(), IndicatorReading::Ready { value: hist });
        values.insert("vol_20".to_string(), IndicatorReading::Ready { value: 0.024 });
        values.insert(
            "volume_ratio_10".to_string(),
            IndicatorReading::Ready { value: 1.5 },
        );
        values.insert(
            "sma_20".to_string(),
            IndicatorReading::Insufficient { have: 3, need: 20 },
        );
        IndicatorSnapshot {
            symbol: "AAPL".into(),
            timestamp: 1_000,
            price: 101.0,
            sample_count: 40,
            values,
        }
    }

    #[test]
    fn brief_labels_indicators() {
        let specs = default_indicators();
        let sig = signal(Direction::Long, 0.62, false);
        let snap = snapshot(75.0, -0.2);
        let brief = NarrativeBrief::from_parts(BriefParts {
            signal: &sig,
            forecast: None,
            sentiment: None,
            indicators: Some(&snap),
            indicator_specs: &specs,
            last_price: Some(PricePoint {
                timestamp: 1_000,
                price: 101.0,
            }),
            change_pct: Some(1.5),
        });
        assert_eq!(brief.headline, "AAPL LONG (confidence 62%)");
        assert_eq!(brief.rsi_label, Some("OVERBOUGHT"));
        assert_eq!(brief.macd_trend, Some("BEARISH"));
        assert_eq!(brief.last_price, Some(101.0));
        assert!(brief.forecast.is_none());
        assert_eq!(
            brief.risk,
            Some(RiskBrief {
                volatility: 0.024,
                level: RiskLevel::Medium
            })
        );
        assert_eq!(brief.volume.as_ref().map(|v| v.unusual), Some(true));
    }

    #[test]
    fn degraded_brief_omits_missing_sections() {
        let specs = default_indicators();
        let sig = signal(Direction::Flat, 0.0, true);
        let brief = NarrativeBrief::from_parts(BriefParts {
            signal: &sig,
            forecast: None,
            sentiment: None,
            indicators: None,
            indicator_specs: &specs,
            last_price: None,
            change_pct: None,
        });
        assert!(brief.headline.ends_with("degraded, no fresh inputs"));
        assert!(brief.rsi.is_none());

        let json = serde_json::to_value(&brief).unwrap();
        assert!(json.get("rsi").is_none());
        assert!(json.get("forecast").is_none());
        assert!(json.get("risk").is_none());
        assert_eq!(json["direction"], "flat");
    }

    #[test]
    fn risk_levels_follow_volatility_thresholds() {
        assert_eq!(risk_level(0.01), RiskLevel::Low);
        assert_eq!(risk_level(0.02), RiskLevel::Low);
        assert_eq!(risk_level(0.025), RiskLevel::Medium);
        assert_eq!(risk_level(0.031), RiskLevel::High);
    }

    #[test]
    fn market_risk_aggregates_symbols_with_readings() {
        let risk = MarketRisk::from_volatilities(&[0.01, 0.04, 0.028], 4);
        assert!((risk.average_volatility - 0.026).abs() < 1e-12);
        assert_eq!(risk.maximum_volatility, 0.04);
        assert_eq!(risk.risk_level, RiskLevel::Medium);
        assert_eq!(risk.market_count, 4);
        assert_eq!(risk.high_volatility_count, 2);

        let empty = MarketRisk::from_volatilities(&[], 2);
        assert_eq!(empty.risk_level, RiskLevel::Unknown);
        assert_eq!(serde_json::to_value(&empty).unwrap()["risk_level"], "UNKNOWN");
    }

    #[test]
    fn ranked_signal_flattens_and_flags_volume() {
        let ranked = RankedSignal::new(signal(Direction::Short, 0.4, false), Some(0.035), Some(1.1));
        assert_eq!(ranked.risk_level, RiskLevel::High);
        assert!(!ranked.unusual_volume);

        let json = serde_json::to_value(&ranked).unwrap();
        assert_eq!(json["symbol"], "AAPL");
        assert_eq!(json["risk_level"], "HIGH");
        assert_eq!(json["volume_ratio"], 1.1);
    }

    #[test]
    fn sentiment_labels_use_band() {
        assert_eq!(sentiment_label(0.3), "POSITIVE");
        assert_eq!(sentiment_label(-0.3), "NEGATIVE");
        assert_eq!(sentiment_label(0.05), "NEUTRAL");
    }
}
