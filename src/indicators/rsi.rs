// =============================================================================
// Relative Strength Index (RSI) -- Wilder's Smoothing
// =============================================================================
//
// Step 1 -- Compute price changes (deltas) from consecutive closes.
// Step 2 -- Seed average gain / average loss with the SMA of the first `period`
//          gains / losses.
// Step 3 -- Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 -- RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Thresholds:  RSI >= 70 => OVERBOUGHT,  RSI <= 30 => OVERSOLD.
// =============================================================================

/// Compute the full RSI series for the given `closes` and `period`.
///
/// One RSI value for each close starting at index `period`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period + 1` => empty vec
/// - Average loss of zero clamps RSI to 100.0; no movement at all gives 50.0.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period].iter().fold((0.0_f64, 0.0_f64), |(g, l), &d| {
        if d > 0.0 {
            (g + d, l)
        } else {
            (g, l + d.abs())
        }
    });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let Some(first) = rsi_from_averages(avg_gain, avg_loss) else {
        return Vec::new();
    };

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    result.push(first);

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_from_averages(avg_gain, avg_loss) {
            Some(rsi) => result.push(rsi),
            None => break,
        }
    }

    result
}

/// Human-readable zone for an RSI value.
pub fn rsi_label(value: f64) -> &'static str {
    if value >= 70.0 {
        "OVERBOUGHT"
    } else if value <= 30.0 {
        "OVERSOLD"
    } else {
        "NEUTRAL"
    }
}

/// Incremental Wilder RSI.
#[derive(Debug, Clone)]
pub struct RsiState {
    period: usize,
    prev_close: Option<f64>,
    deltas: usize,
    seed_gain: f64,
    seed_loss: f64,
    averages: Option<(f64, f64)>,
}

impl RsiState {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            deltas: 0,
            seed_gain: 0.0,
            seed_loss: 0.0,
            averages: None,
        }
    }

    /// Push a close; `None` until `period + 1` closes have been seen.
    pub fn push(&mut self, close: f64) -> Option<f64> {
        let Some(prev) = self.prev_close.replace(close) else {
            return None;
        };
        let delta = close - prev;
        let period_f = self.period as f64;

        match self.averages {
            Some((avg_gain, avg_loss)) => {
                let gain = if delta > 0.0 { delta } else { 0.0 };
                let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
                let g = (avg_gain * (period_f - 1.0) + gain) / period_f;
                let l = (avg_loss * (period_f - 1.0) + loss) / period_f;
                self.averages = Some((g, l));
                rsi_from_averages(g, l)
            }
            None => {
                if delta > 0.0 {
                    self.seed_gain += delta;
                } else {
                    self.seed_loss += delta.abs();
                }
                self.deltas += 1;
                if self.deltas < self.period {
                    return None;
                }
                let g = self.seed_gain / period_f;
                let l = self.seed_loss / period_f;
                self.averages = Some((g, l));
                rsi_from_averages(g, l)
            }
        }
    }
}

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}
