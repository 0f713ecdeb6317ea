//! Decoded protocol messages
//!
//! [`ProtocolMessage`] is a closed set of message kinds. Tags the decoder does
//! not know become [`ProtocolMessage::Unknown`] so newer senders keep working
//! with older receivers.

use serde::{Deserialize, Serialize};

use super::{SubjectId, Timecode};

/// Command flag: the focus distance field carries a calibrated value.
pub const COMMAND_FOCUS_DISTANCE: u8 = 0x02;

/// Device-side timing of a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct DeviceTimestamp {
    /// Timecode stamped by the rig
    pub timecode: Timecode,
    /// Rolling 8-bit packet counter
    pub packet_number: u8,
}

impl DeviceTimestamp {
    pub fn new(timecode: Timecode, packet_number: u8) -> Self {
        Self { timecode, packet_number }
    }
}

/// Camera orientation.
///
/// HF and protocol version 1 carry Euler angles in degrees; version 2
/// tracking messages carry a unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum Orientation {
    Euler { pan: f32, tilt: f32, roll: f32 },
    Quaternion { x: f32, y: f32, z: f32, w: f32 },
}

/// Camera pose at one instant. Position is in metres in the rig's frame
/// (x right, y up, -z forward).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct TrackingState {
    pub position: [f32; 3],
    pub orientation: Orientation,
}

/// Lens state as computed upstream by the rig.
///
/// Values are carried verbatim. The derived accessors reproduce the
/// conversions a camera model needs; they do not alter the stored values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct LensState {
    /// Horizontal field of view in degrees
    pub field_of_view: f32,
    pub aspect_ratio: f32,
    /// Focus distance in metres
    pub focus: f32,
    /// Normalized zoom encoder position
    pub zoom: f32,
    /// Radial distortion coefficients
    pub k1: f32,
    pub k2: f32,
    /// Optical centre shift in millimetres on the projection area
    pub center_shift: [f32; 2],
    /// Projection area (film back) width in millimetres
    pub projection_area_width: f32,
    /// Raw command flags from the packet
    pub command: u8,
}

impl LensState {
    /// Focal length in millimetres from projection width and horizontal FOV.
    pub fn focal_length(&self) -> f32 {
        let half_fov = self.field_of_view.to_radians() * 0.5;
        self.projection_area_width / (2.0 * half_fov.tan())
    }

    /// Film back height in millimetres.
    pub fn projection_area_height(&self) -> f32 {
        self.projection_area_width / self.aspect_ratio
    }

    /// Whether the rig flagged the focus distance as calibrated.
    pub fn focus_distance_valid(&self) -> bool {
        self.command & COMMAND_FOCUS_DISTANCE != 0
    }

    /// Focus distance in centimetres.
    pub fn focus_distance_cm(&self) -> f32 {
        self.focus * 100.0
    }

    /// Principal point normalized to the image, (0.5, 0.5) when centred.
    pub fn principal_point(&self) -> [f32; 2] {
        [
            -self.center_shift[0] / self.projection_area_width + 0.5,
            self.center_shift[1] * self.aspect_ratio / self.projection_area_width + 0.5,
        ]
    }

    /// Focal length normalized by the projection area (fx, fy).
    pub fn normalized_focal_length(&self) -> [f32; 2] {
        let fx = self.focal_length() / self.projection_area_width;
        [fx, fx * self.aspect_ratio]
    }
}

/// Position and orientation sample, optionally with lens state captured at
/// the same instant (HF packets always carry both).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSample {
    pub subject: SubjectId,
    pub device_time: DeviceTimestamp,
    pub tracking: TrackingState,
    pub lens: Option<LensState>,
}

/// Lens-only sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensSample {
    pub subject: SubjectId,
    pub device_time: DeviceTimestamp,
    pub lens: LensState,
}

/// Human-readable label announced by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectAnnounce {
    pub subject: SubjectId,
    pub label: String,
}

/// Keep-alive without state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub subject: SubjectId,
    pub device_time: DeviceTimestamp,
}

/// Error or status report raised by the rig.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub subject: SubjectId,
    pub code: u16,
    pub message: String,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Tracking(TrackingSample),
    Lens(LensSample),
    SubjectAnnounce(SubjectAnnounce),
    Heartbeat(Heartbeat),
    Status(DeviceStatus),
    /// A well-framed message with a tag this version does not interpret
    Unknown { subject: Option<SubjectId>, tag: u8, payload_len: usize },
}

impl ProtocolMessage {
    /// Subject the message refers to, when known.
    pub fn subject(&self) -> Option<SubjectId> {
        match self {
            ProtocolMessage::Tracking(m) => Some(m.subject),
            ProtocolMessage::Lens(m) => Some(m.subject),
            ProtocolMessage::SubjectAnnounce(m) => Some(m.subject),
            ProtocolMessage::Heartbeat(m) => Some(m.subject),
            ProtocolMessage::Status(m) => Some(m.subject),
            ProtocolMessage::Unknown { subject, .. } => *subject,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Tracking(_) => "Tracking",
            ProtocolMessage::Lens(_) => "Lens",
            ProtocolMessage::SubjectAnnounce(_) => "SubjectAnnounce",
            ProtocolMessage::Heartbeat(_) => "Heartbeat",
            ProtocolMessage::Status(_) => "Status",
            ProtocolMessage::Unknown { .. } => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens() -> LensState {
        LensState {
            field_of_view: 60.0,
            aspect_ratio: 16.0 / 9.0,
            focus: 3.5,
            zoom: 0.25,
            k1: 0.01,
            k2: -0.002,
            center_shift: [0.0, 0.0],
            projection_area_width: 9.59,
            command: COMMAND_FOCUS_DISTANCE,
        }
    }

    #[test]
    fn focal_length_from_fov() {
        let lens = lens();
        // w / (2 tan(30deg))
        let expected = 9.59 / (2.0 * (30.0f32).to_radians().tan());
        assert!((lens.focal_length() - expected).abs() < 1e-4);
        assert!((lens.projection_area_height() - 9.59 * 9.0 / 16.0).abs() < 1e-4);
    }

    #[test]
    fn centred_lens_has_centred_principal_point() {
        let pp = lens().principal_point();
        assert!((pp[0] - 0.5).abs() < f32::EPSILON);
        assert!((pp[1] - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn focus_flag_and_units() {
        let mut lens = lens();
        assert!(lens.focus_distance_valid());
        assert!((lens.focus_distance_cm() - 350.0).abs() < 1e-3);
        lens.command = 0x01;
        assert!(!lens.focus_distance_valid());
    }

    #[test]
    fn unknown_messages_report_subject() {
        let msg = ProtocolMessage::Unknown { subject: Some(SubjectId(4)), tag: 0x42, payload_len: 9 };
        assert_eq!(msg.subject(), Some(SubjectId(4)));
        assert_eq!(msg.kind(), "Unknown");
    }
}
