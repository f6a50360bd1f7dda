// =============================================================================
// Realised Volatility -- std-dev of log returns over a window
// =============================================================================

use crate::indicators::rolling::RollingMoments;

/// Population standard deviation of the last `window` log returns.
///
/// Needs `window + 1` strictly positive closes.
pub fn calculate_volatility(closes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || closes.len() < window + 1 {
        return None;
    }
    let tail = &closes[closes.len() - window - 1..];
    let returns: Vec<f64> = tail
        .windows(2)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.iter().any(|r| !r.is_finite()) {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    Some(var.sqrt())
}

/// Incremental realised volatility.
#[derive(Debug, Clone)]
pub struct VolatilityState {
    prev_close: Option<f64>,
    returns: RollingMoments,
}

impl VolatilityState {
    pub fn new(window: usize) -> Self {
        Self {
            prev_close: None,
            returns: RollingMoments::new(window),
        }
    }

    pub fn push(&mut self, close: f64) -> Option<f64> {
        let prev = self.prev_close.replace(close)?;
        let r = (close / prev).ln();
        if !r.is_finite() {
            return None;
        }
        self.returns.push(r);
        if self.returns.is_full() {
            self.returns.std_dev()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_growth_has_zero_volatility() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 * 1.01_f64.powi(i)).collect();
        let v = calculate_volatility(&closes, 20).unwrap();
        assert!(v < 1e-12);
    }

    #[test]
    fn insufficient_data() {
        assert!(calculate_volatility(&[1.0, 2.0], 2).is_none());
    }

    #[test]
    fn incremental_matches_batch() {
        let closes: Vec<f64> = (0..5_000)
            .map(|i| 30_000.0 * (1.0 + (i as f64 * 0.17).sin() * 0.01))
            .collect();
        let mut state = VolatilityState::new(20);
        for (i, &c) in closes.iter().enumerate() {
            let inc = state.push(c);
            let batch = calculate_volatility(&closes[..=i], 20);
            match (inc, batch) {
                (None, None) => {}
                (Some(a), Some(b)) => assert!((a - b).abs() < 1e-9, "{a} vs {b} at {i}"),
                other => panic!("mismatch at {i}: {other:?}"),
            }
        }
    }
}
