// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` closes.
// The incremental state performs exactly the same floating-point operations in
// the same order as the batch function, so both produce identical bits.
// =============================================================================

/// Compute the EMA series for the given `closes` slice and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to a close starting at index `period - 1`.
///
/// # Edge cases
/// - `period == 0` => empty vec (division by zero guard)
/// - `closes.len() < period` => empty vec
/// - Non-finite intermediate values stop the series.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let sma: f64 = closes[..period].iter().fold(0.0, |acc, x| acc + x) / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// Incremental EMA.
#[derive(Debug, Clone)]
pub struct EmaState {
    period: usize,
    multiplier: f64,
    seed_sum: f64,
    seen: usize,
    value: Option<f64>,
}

impl EmaState {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            multiplier: 2.0 / (period + 1) as f64,
            seed_sum: 0.0,
            seen: 0,
            value: None,
        }
    }

    /// Push a value; `None` until `period` values have been seen.
    pub fn push(&mut self, close: f64) -> Option<f64> {
        match self.value {
            Some(prev) => {
                let ema = close * self.multiplier + prev * (1.0 - self.multiplier);
                if ema.is_finite() {
                    self.value = Some(ema);
                }
            }
            None => {
                self.seed_sum += close;
                self.seen += 1;
                if self.seen == self.period {
                    let sma = self.seed_sum / self.period as f64;
                    if sma.is_finite() {
                        self.value = Some(sma);
                    }
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_input() {
        assert!(calculate_ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero() {
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_period_equals_length() {
        let ema = calculate_ema(&[2.0, 4.0, 6.0], 3);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // SMA of first 5 = 3.0, multiplier = 1/3
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        assert!((ema[0] - expected).abs() < 1e-10);
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * mult + expected * (1.0 - mult);
            assert!((ema[i + 1] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn incremental_is_bit_identical_to_batch() {
        let closes: Vec<f64> = (0..2_000)
            .map(|i| 250.0 + (i as f64 * 0.05).sin() * 10.0 + (i % 13) as f64 * 0.3)
            .collect();
        let batch = calculate_ema(&closes, 26);
        let mut state = EmaState::new(26);
        let incremental: Vec<f64> = closes.iter().filter_map(|&c| state.push(c)).collect();
        assert_eq!(batch, incremental);
    }

    #[test]
    fn incremental_none_during_warmup() {
        let mut state = EmaState::new(3);
        assert_eq!(state.push(1.0), None);
        assert_eq!(state.push(2.0), None);
        assert_eq!(state.push(3.0), Some(2.0));
    }
}
