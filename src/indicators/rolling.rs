// =============================================================================
// Rolling Window Moments -- O(1) mean / variance over a fixed window
// =============================================================================
//
// Values are stored shifted by the first observation `K` so that the running
// sum of squares does not cancel catastrophically for high-priced assets:
//
//   mean     = K + Σ(x - K) / n
//   variance = Σ(x - K)² / n - (Σ(x - K) / n)²
//
// Both sums use Neumaier compensation, so adding and removing values over
// very long streams does not accumulate drift relative to a fresh two-pass
// computation over the same window.
// =============================================================================

use std::collections::VecDeque;

/// Neumaier-compensated running sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn sub(&mut self, value: f64) {
        self.add(-value);
    }

    pub fn value(&self) -> f64 {
        self.sum + self.compensation
    }
}

/// Fixed-capacity rolling window with incremental first and second moments.
#[derive(Debug, Clone)]
pub struct RollingMoments {
    data: VecDeque<f64>,
    capacity: usize,
    shift: Option<f64>,
    sum: CompensatedSum,
    sum_sq: CompensatedSum,
}

impl RollingMoments {
    /// `capacity` must be at least 1; callers validate window sizes up front.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
            shift: None,
            sum: CompensatedSum::default(),
            sum_sq: CompensatedSum::default(),
        }
    }

    /// Push a value, evicting and returning the oldest one once full.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let shift = *self.shift.get_or_insert(value);

        let removed = if self.data.len() >= self.capacity {
            self.data.pop_front()
        } else {
            None
        };
        if let Some(old) = removed {
            let d = old - shift;
            self.sum.sub(d);
            self.sum_sq.sub(d * d);
        }

        let d = value - shift;
        self.sum.add(d);
        self.sum_sq.add(d * d);
        self.data.push_back(value);
        removed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mean(&self) -> Option<f64> {
        if self.data.is_empty() {
            return None;
        }
        let n = self.data.len() as f64;
        Some(self.shift.unwrap_or(0.0) + self.sum.value() / n)
    }

    /// Population variance; never negative.
    pub fn variance(&self) -> Option<f64> {
        if self.data.is_empty() {
            return None;
        }
        let n = self.data.len() as f64;
        let m = self.sum.value() / n;
        Some((self.sum_sq.value() / n - m * m).max(0.0))
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}
