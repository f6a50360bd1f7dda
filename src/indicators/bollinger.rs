// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ). Two scalar readings are derived from them:
//
//   %B    = (price - lower) / (upper - lower)   (> 1 above the band, < 0 below)
//   Width = (upper - lower) / middle * 100
//
// %B feeds the band-breakout rule; width is a volatility gauge.

use crate::indicators::rolling::RollingMoments;

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

impl BollingerResult {
    fn from_moments(middle: f64, std_dev: f64, num_std: f64) -> Option<Self> {
        if middle == 0.0 {
            return None;
        }
        let upper = middle + num_std * std_dev;
        let lower = middle - num_std * std_dev;
        let width = (upper - lower) / middle * 100.0;
        width.is_finite().then_some(Self {
            upper,
            middle,
            lower,
            width,
        })
    }

    /// Position of `price` within the bands. A collapsed band reads 0.5.
    pub fn percent_b(&self, price: f64) -> f64 {
        let range = self.upper - self.lower;
        if range <= f64::EPSILON * self.middle.abs() {
            0.5
        } else {
            (price - self.lower) / range
        }
    }
}

/// Calculate Bollinger Bands over the last `period` closes.
///
/// Returns `None` with fewer than `period` data points or a zero middle band.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;

    BollingerResult::from_moments(middle, variance.sqrt(), num_std)
}

/// Incremental Bollinger Bands.
#[derive(Debug, Clone)]
pub struct BollingerState {
    window: RollingMoments,
    num_std: f64,
}

impl BollingerState {
    pub fn new(period: usize, num_std: f64) -> Self {
        Self {
            window: RollingMoments::new(period),
            num_std,
        }
    }

    pub fn push(&mut self, close: f64) -> Option<BollingerResult> {
        self.window.push(close);
        if !self.window.is_full() {
            return None;
        }
        let middle = self.window.mean()?;
        let std_dev = self.window.std_dev()?;
        BollingerResult::from_moments(middle, std_dev, self.num_std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn flat_band_percent_b_is_centre() {
        let bb = calculate_bollinger(&[100.0; 20], 20, 2.0).unwrap();
        assert!(bb.width.abs() < 1e-10);
        assert_eq!(bb.percent_b(100.0), 0.5);
    }

    #[test]
    fn percent_b_above_band() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.percent_b(bb.upper + 1.0) > 1.0);
        assert!(bb.percent_b(bb.lower - 1.0) < 0.0);
    }

    #[test]
    fn incremental_matches_batch_over_long_stream() {
        let closes: Vec<f64> = (0..10_000)
            .map(|i| 1_800.0 + (i as f64 * 0.013).sin() * 40.0 + (i % 11) as f64 * 0.5)
            .collect();
        let mut state = BollingerState::new(20, 2.0);
        for (i, &c) in closes.iter().enumerate() {
            let inc = state.push(c);
            let batch = calculate_bollinger(&closes[..=i], 20, 2.0);
            match (inc, batch) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    assert!((a.middle - b.middle).abs() < 1e-8);
                    assert!((a.upper - b.upper).abs() < 1e-6);
                    assert!((a.lower - b.lower).abs() < 1e-6);
                }
                other => panic!("mismatch at {i}: {other:?}"),
            }
        }
    }
}
