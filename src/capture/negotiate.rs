//! Frame-rate negotiation against what a source supports

use serde::{Deserialize, Serialize};

/// Inclusive range of frame rates a source supports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameRateRange {
    pub min: f64,
    pub max: f64,
}

impl FrameRateRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// A single discrete rate
    pub fn exact(fps: f64) -> Self {
        Self { min: fps, max: fps }
    }

    pub fn contains(&self, fps: f64) -> bool {
        fps >= self.min && fps <= self.max
    }

    fn closest_to(&self, fps: f64) -> f64 {
        fps.clamp(self.min, self.max)
    }
}

/// Supported rate closest to `target`
///
/// Minimises the absolute difference over all ranges; on a tie the higher
/// rate wins. Returns `None` when there are no ranges.
pub fn closest_frame_rate(target: f64, ranges: &[FrameRateRange]) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    for range in ranges {
        let candidate = range.closest_to(target);
        let diff = (candidate - target).abs();
        best = match best {
            Some((best_rate, best_diff))
                if diff > best_diff || (diff == best_diff && candidate <= best_rate) =>
            {
                Some((best_rate, best_diff))
            }
            _ => Some((candidate, diff)),
        };
    }
    best.map(|(rate, _)| rate)
}
