//! Update rate control for snapshot subscriptions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery rate for [`TrackingConnection::subscribe`](crate::TrackingConnection::subscribe).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum UpdateRate {
    /// Every publication
    Native,

    /// At most this many updates per second, latest wins.
    /// Rates at or above the source rate behave like Native.
    Max(u32),
}

impl UpdateRate {
    /// Normalize against the source frequency.
    pub fn normalize(self, source_hz: f64) -> Self {
        match self {
            UpdateRate::Native => UpdateRate::Native,
            UpdateRate::Max(0) => UpdateRate::Native,
            UpdateRate::Max(hz) if hz as f64 >= source_hz => UpdateRate::Native,
            UpdateRate::Max(hz) => UpdateRate::Max(hz),
        }
    }

    /// Throttle interval if one is needed.
    pub fn throttle_interval(self, source_hz: f64) -> Option<Duration> {
        match self.normalize(source_hz) {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}
