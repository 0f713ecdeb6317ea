//! Sample builders shared by unit tests and benches
//!
//! Samples carry a 60 fps timecode that starts at 10:00:00:00 and advances
//! one frame per packet number.

#![cfg(any(test, feature = "benchmark"))]

use crate::types::{
    COMMAND_FOCUS_DISTANCE, DeviceTimestamp, Heartbeat, LensSample, LensState, Orientation, Snapshot, SubjectId,
    SubjectStats, Timecode, TrackingSample, TrackingState,
};

/// Timecode rate used by the sample builders.
pub const SAMPLE_RATE: u32 = 60;

/// Frame number of 10:00:00:00 at [`SAMPLE_RATE`].
pub const BASE_FRAME: i64 = 10 * 3600 * SAMPLE_RATE as i64;

/// A 35mm-ish lens at 60 degrees with a calibrated focus distance.
pub fn sample_lens_state() -> LensState {
    LensState {
        field_of_view: 60.0,
        aspect_ratio: 16.0 / 9.0,
        focus: 3.5,
        zoom: 0.25,
        k1: 0.012,
        k2: -0.003,
        center_shift: [0.05, -0.02],
        projection_area_width: 9.59,
        command: COMMAND_FOCUS_DISTANCE,
    }
}

fn device_time(frame: i64, rate: u32) -> DeviceTimestamp {
    DeviceTimestamp::new(Timecode::from_frame_number(frame, rate), frame as u8)
}

/// Tracking sample at an absolute frame number; the packet number is the
/// frame's low byte.
pub fn tracking_at(subject: SubjectId, frame: i64, rate: u32) -> TrackingSample {
    let t = frame as f32 / rate as f32;
    TrackingSample {
        subject,
        device_time: device_time(frame, rate),
        tracking: TrackingState {
            position: [t.sin(), 1.6, -2.0 + t.cos()],
            orientation: Orientation::Euler { pan: 12.5, tilt: -3.0, roll: 0.25 },
        },
        lens: Some(sample_lens_state()),
    }
}

/// HF-shaped tracking sample (Euler angles plus lens) for a packet number.
pub fn sample_tracking(subject: SubjectId, packet: u8) -> TrackingSample {
    tracking_at(subject, BASE_FRAME + i64::from(packet), SAMPLE_RATE)
}

pub fn sample_lens(subject: SubjectId, packet: u8) -> LensSample {
    LensSample {
        subject,
        device_time: device_time(BASE_FRAME + i64::from(packet), SAMPLE_RATE),
        lens: sample_lens_state(),
    }
}

pub fn sample_heartbeat(subject: SubjectId, packet: u8) -> Heartbeat {
    Heartbeat { subject, device_time: device_time(BASE_FRAME + i64::from(packet), SAMPLE_RATE) }
}

/// Snapshot whose fields are all derived from `version`.
pub fn snapshot_for(subject: SubjectId, version: u64) -> Snapshot {
    let sample = sample_tracking(subject, version as u8);
    let mut tracking = sample.tracking;
    tracking.position[0] = version as f32;
    Snapshot {
        subject,
        label: Some(format!("Camera {}", subject)),
        version,
        timestamp: version as f64 / 60.0,
        device_time: sample.device_time,
        frame_time: None,
        tracking: Some(tracking),
        lens: sample.lens,
        stats: SubjectStats { accepted: version, ..SubjectStats::default() },
        stale: false,
    }
}
