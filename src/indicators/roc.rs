// =============================================================================
// Rate of Change (ROC) -- Momentum Indicator
// =============================================================================
//
// ROC measures the percentage change in price over a look-back period:
//   ROC = ((close - close_n) / close_n) * 100
//
// Positive ROC indicates upward momentum; negative indicates downward.

use std::collections::VecDeque;

/// Calculate the ROC series, one value per close starting at index `period`.
pub fn calculate_roc(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }

    (period..closes.len())
        .map(|i| roc(closes[i], closes[i - period]))
        .collect()
}

fn roc(close: f64, prev: f64) -> f64 {
    if prev == 0.0 {
        0.0
    } else {
        ((close - prev) / prev) * 100.0
    }
}

/// Incremental ROC backed by a `period + 1` ring.
#[derive(Debug, Clone)]
pub struct RocState {
    period: usize,
    ring: VecDeque<f64>,
}

impl RocState {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            ring: VecDeque::with_capacity(period + 1),
        }
    }

    pub fn push(&mut self, close: f64) -> Option<f64> {
        self.ring.push_back(close);
        if self.ring.len() > self.period + 1 {
            self.ring.pop_front();
        }
        if self.ring.len() == self.period + 1 {
            self.ring.front().map(|&prev| roc(close, prev))
        } else {
            None
        }
    }
}
