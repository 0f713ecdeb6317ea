//! Published per-subject state

use serde::{Deserialize, Serialize};

use super::{DeviceTimestamp, LensState, QualifiedFrameTime, SubjectId, TrackingState};

/// Per-subject ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct SubjectStats {
    /// Packet numbers skipped by forward jumps, less late arrivals that filled a gap
    pub dropped: u64,
    /// Samples that arrived behind the newest accepted one
    pub out_of_order: u64,
    /// Samples repeating the newest accepted packet number
    pub duplicates: u64,
    /// Device clock regressions that re-anchored the timeline
    pub clock_resets: u64,
    /// Samples accepted into the snapshot
    pub accepted: u64,
}

/// Immutable copy of a subject's state at publication.
///
/// Replaced as a whole; readers never observe a mix of two publications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct Snapshot {
    pub subject: SubjectId,
    pub label: Option<String>,
    /// Increments on every publication for this subject
    pub version: u64,
    /// Reconciled local time in seconds since the connection epoch
    pub timestamp: f64,
    pub device_time: DeviceTimestamp,
    /// Frame time inferred from timecode overflows, once both rates are known
    pub frame_time: Option<QualifiedFrameTime>,
    pub tracking: Option<TrackingState>,
    pub lens: Option<LensState>,
    pub stats: SubjectStats,
    /// Set when the subject has been silent longer than the staleness timeout
    pub stale: bool,
}

impl Snapshot {
    /// Label if one is known, otherwise the subject id.
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => self.subject.to_string(),
        }
    }
}
