// =============================================================================
// MACD Histogram
// =============================================================================
//
//   MACD line   = EMA_fast - EMA_slow
//   Signal line = EMA_signal(MACD line)
//   Histogram   = MACD line - Signal line
//
// A positive histogram means short-term momentum is accelerating upward.

use crate::indicators::ema::{calculate_ema, EmaState};

/// Histogram series, one value per close starting at index
/// `slow - 1 + signal - 1`. Requires `fast < slow`.
pub fn calculate_macd_histogram(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<f64> {
    if fast == 0 || signal == 0 || fast >= slow {
        return Vec::new();
    }
    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_slow.is_empty() {
        return Vec::new();
    }

    // ema_fast[k] belongs to close k + fast - 1; ema_slow[k] to close k + slow - 1.
    let offset = slow - fast;
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .filter_map(|(k, s)| ema_fast.get(k + offset).map(|f| f - s))
        .collect();

    let signal_line = calculate_ema(&macd_line, signal);
    signal_line
        .iter()
        .enumerate()
        .map(|(j, sig)| macd_line[j + signal - 1] - sig)
        .collect()
}

/// Incremental MACD histogram.
#[derive(Debug, Clone)]
pub struct MacdState {
    fast: EmaState,
    slow: EmaState,
    signal: EmaState,
}

impl MacdState {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: EmaState::new(fast),
            slow: EmaState::new(slow),
            signal: EmaState::new(signal),
        }
    }

    pub fn push(&mut self, close: f64) -> Option<f64> {
        let fast = self.fast.push(close);
        let slow = self.slow.push(close);
        let macd = fast? - slow?;
        let signal = self.signal.push(macd)?;
        Some(macd - signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_periods_yield_nothing() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd_histogram(&closes, 26, 12, 9).is_empty());
        assert!(calculate_macd_histogram(&closes, 0, 12, 9).is_empty());
    }

    #[test]
    fn series_length() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let hist = calculate_macd_histogram(&closes, 12, 26, 9);
        assert_eq!(hist.len(), 100 - (26 - 1) - (9 - 1));
    }

    #[test]
    fn accelerating_uptrend_has_positive_histogram() {
        let closes: Vec<f64> = (1..=120).map(|x| (x as f64).powf(1.5)).collect();
        let hist = calculate_macd_histogram(&closes, 12, 26, 9);
        assert!(*hist.last().unwrap() > 0.0);
    }

    #[test]
    fn incremental_is_bit_identical_to_batch() {
        let closes: Vec<f64> = (0..1_500)
            .map(|i| 75.0 + (i as f64 * 0.02).sin() * 6.0 + (i as f64 * 0.31).cos())
            .collect();
        let batch = calculate_macd_histogram(&closes, 12, 26, 9);
        let mut state = MacdState::new(12, 26, 9);
        let incremental: Vec<f64> = closes.iter().filter_map(|&c| state.push(c)).collect();
        assert_eq!(batch, incremental);
    }
}
