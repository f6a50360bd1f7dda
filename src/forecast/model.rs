// =============================================================================
// Linear Trend Model -- least-squares fit of log-price against time
// =============================================================================
//
//   ln p(t) = intercept + slope · (t - t0)
//
// Point forecast for a horizon h from base price p₀:
//
//   point = p₀ · exp(slope · h)
//
// The interval is symmetric in log space:
//
//   half_width = z · residual_sd · sqrt(1 + h / span)
//
// so it widens as the forecast reaches further past the fitted data.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, RetrainError};
use crate::market_data::PricePoint;
use crate::types::Timestamp;

/// Immutable fitted parameters. Published whole; never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub symbol: String,
    pub version: u64,
    /// Timestamp of the newest sample in the training window.
    pub trained_through: Timestamp,
    /// Log-price slope per millisecond.
    pub slope: f64,
    pub intercept: f64,
    /// Standard deviation of the log-price residuals.
    pub residual_sd: f64,
    pub r_squared: f64,
    pub samples: usize,
    /// Time covered by the training window, in ms.
    pub span_ms: i64,
}

/// Output of a successful fit, before a version is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendFit {
    pub slope: f64,
    pub intercept: f64,
    pub residual_sd: f64,
    pub r_squared: f64,
    pub samples: usize,
    pub span_ms: i64,
    pub trained_through: Timestamp,
}

impl TrendFit {
    pub fn into_snapshot(self, symbol: &str, version: u64) -> ModelSnapshot {
        ModelSnapshot {
            symbol: symbol.to_string(),
            version,
            trained_through: self.trained_through,
            slope: self.slope,
            intercept: self.intercept,
            residual_sd: self.residual_sd,
            r_squared: self.r_squared,
            samples: self.samples,
            span_ms: self.span_ms,
        }
    }
}

/// Fit the trend on `points` (oldest first).
pub fn fit_trend(symbol: &str, points: &[PricePoint], min_samples: usize) -> Result<TrendFit, RetrainError> {
    let need = min_samples.max(3);
    if points.len() < need {
        return Err(RetrainError::InsufficientHistory {
            symbol: symbol.to_string(),
            have: points.len(),
            need,
        });
    }
    if points.iter().any(|p| !(p.price.is_finite() && p.price > 0.0)) {
        return Err(RetrainError::Degenerate {
            symbol: symbol.to_string(),
            reason: "non-positive price in window".into(),
        });
    }

    let t0 = points[0].timestamp;
    let n = points.len() as f64;
    let xs: Vec<f64> = points.iter().map(|p| (p.timestamp - t0) as f64).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.price.ln()).collect();

    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = ys.iter().sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        let dx = x - x_mean;
        let dy = y - y_mean;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    if sxx <= 0.0 {
        return Err(RetrainError::Degenerate {
            symbol: symbol.to_string(),
            reason: "all samples share one timestamp".into(),
        });
    }

    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;

    let sse: f64 = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| {
            let r = y - (intercept + slope * x);
            r * r
        })
        .sum();
    let residual_sd = (sse / (n - 2.0)).sqrt();
    // A perfectly flat series is perfectly explained.
    let r_squared = if syy > 0.0 { (1.0 - sse / syy).clamp(0.0, 1.0) } else { 1.0 };

    if ![slope, intercept, residual_sd, r_squared].iter().all(|v| v.is_finite()) {
        return Err(RetrainError::Diverged {
            symbol: symbol.to_string(),
        });
    }

    let last = points[points.len() - 1].timestamp;
    Ok(TrendFit {
        slope,
        intercept,
        residual_sd,
        r_squared,
        samples: points.len(),
        span_ms: last - t0,
        trained_through: last,
    })
}

/// A point forecast with interval, as produced from one model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub symbol: String,
    /// Timestamp of the price the forecast was projected from.
    pub as_of: Timestamp,
    pub horizon_ms: i64,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
    pub model_version: u64,
    pub base_price: f64,
}

impl Forecast {
    /// Expected simple return `point / base - 1`.
    pub fn expected_return(&self) -> f64 {
        self.point / self.base_price - 1.0
    }

    /// Half the interval width expressed as a return.
    pub fn half_width_return(&self) -> f64 {
        (self.upper - self.lower) / (2.0 * self.base_price)
    }
}

impl ModelSnapshot {
    /// Project `base` forward by `horizon_ms`.
    pub fn predict(
        &self,
        base: PricePoint,
        horizon_ms: i64,
        z: f64,
    ) -> Result<Forecast, ForecastError> {
        if horizon_ms <= 0 {
            return Err(ForecastError::InvalidHorizon(horizon_ms));
        }
        let h = horizon_ms as f64;
        let span = self.span_ms.max(1) as f64;

        let drift = self.slope * h;
        let half = z * self.residual_sd * (1.0 + h / span).sqrt();

        let point = base.price * drift.exp();
        let lower = base.price * (drift - half).exp();
        let upper = base.price * (drift + half).exp();

        let n = self.samples as f64;
        let confidence = (self.r_squared * (n / (n + 10.0)) * (span / (span + h))).clamp(0.0, 1.0);

        if ![point, lower, upper, confidence].iter().all(|v| v.is_finite()) {
            return Err(ForecastError::NonFinite(self.symbol.clone()));
        }

        Ok(Forecast {
            symbol: self.symbol.clone(),
            as_of: base.timestamp,
            horizon_ms,
            point,
            lower,
            upper,
            confidence,
            model_version: self.version,
            base_price: base.price,
        })
    }
}
