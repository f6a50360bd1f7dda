// =============================================================================
// Volume Ratio -- current volume against its rolling mean
// =============================================================================

use crate::indicators::rolling::RollingMoments;

/// Ratio above which volume counts as unusual.
pub const UNUSUAL_VOLUME_RATIO: f64 = 1.2;

/// Last volume divided by the mean of the last `window` volumes (the last
/// one included). `None` with fewer than `window` volumes or a zero mean.
pub fn calculate_volume_ratio(volumes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || volumes.len() < window {
        return None;
    }
    let tail = &volumes[volumes.len() - window..];
    let mean = tail.iter().sum::<f64>() / window as f64;
    if mean <= 0.0 {
        return None;
    }
    tail.last().map(|v| v / mean)
}

/// Incremental volume ratio.
#[derive(Debug, Clone)]
pub struct VolumeRatioState {
    window: RollingMoments,
}

impl VolumeRatioState {
    pub fn new(window: usize) -> Self {
        Self {
            window: RollingMoments::new(window),
        }
    }

    pub fn push(&mut self, volume: f64) -> Option<f64> {
        self.window.push(volume);
        if !self.window.is_full() {
            return None;
        }
        let mean = self.window.mean()?;
        if mean <= 0.0 {
            return None;
        }
        Some(volume / mean)
    }
}
