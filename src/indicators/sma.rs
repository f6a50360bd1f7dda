// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================

use crate::indicators::rolling::RollingMoments;

/// Compute the SMA series; one value per close starting at index `period - 1`.
///
/// Empty when `period == 0` or there are fewer than `period` closes.
pub fn calculate_sma(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    closes
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

/// Incremental SMA over a ring buffer.
#[derive(Debug, Clone)]
pub struct SmaState {
    window: RollingMoments,
}

impl SmaState {
    pub fn new(period: usize) -> Self {
        Self {
            window: RollingMoments::new(period),
        }
    }

    /// Push a close; `None` until the window is full.
    pub fn push(&mut self, close: f64) -> Option<f64> {
        self.window.push(close);
        if self.window.is_full() {
            self.window.mean()
        } else {
            None
        }
    }
}
