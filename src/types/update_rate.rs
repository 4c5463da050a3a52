//! Update rate control for observer frame streams

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery rate for observer frame streams.
///
/// The producer always samples at its configured frequency; this only
/// controls how often an observer sees the latest frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every frame the timing worker publishes
    Native,

    /// At most this many frames per second.
    /// A rate at or above the source rate behaves like `Native`.
    Max(u32),
}

impl UpdateRate {
    /// Effective rate against the producer's sampling frequency.
    pub fn normalize(self, source_hz: f64) -> Self {
        match self {
            UpdateRate::Native => UpdateRate::Native,
            UpdateRate::Max(0) => UpdateRate::Max(1),
            UpdateRate::Max(hz) if hz as f64 >= source_hz => UpdateRate::Native,
            UpdateRate::Max(hz) => UpdateRate::Max(hz),
        }
    }

    /// Minimum spacing between delivered frames, if throttled.
    pub fn throttle_interval(self, source_hz: f64) -> Option<Duration> {
        match self.normalize(source_hz) {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_above_source_is_native() {
        assert_eq!(UpdateRate::Max(120).normalize(60.0), UpdateRate::Native);
        assert_eq!(UpdateRate::Max(60).normalize(60.0), UpdateRate::Native);
        assert!(UpdateRate::Max(60).throttle_interval(60.0).is_none());
    }

    #[test]
    fn rate_below_source_throttles() {
        let interval = UpdateRate::Max(10).throttle_interval(60.0).expect("throttled");
        assert_eq!(interval, Duration::from_millis(100));
    }

    #[test]
    fn zero_rate_is_clamped() {
        assert_eq!(UpdateRate::Max(0).normalize(60.0), UpdateRate::Max(1));
    }
}
