//! Core types for camera-tracking data.
//!
//! ## Architecture
//!
//! - [`RawChunk`] and [`Frame`] carry bytes from the transport through the framer
//! - [`ProtocolMessage`] is the closed set of decoded messages
//! - [`Timecode`] and [`DeviceTimestamp`] describe device-side timing
//! - [`Snapshot`] is the immutable per-subject state handed to consumers
//! - [`ConnectionState`] and [`UpdateRate`] describe the connection handle
//!
//! ## Usage Example
//!
//! ```rust
//! use stype_link::types::{LensState, Timecode};
//!
//! let tc = Timecode::from_wire([0x2D, 0x0F, 0x52]);
//! assert_eq!(tc.to_string(), "10:16:30:45");
//!
//! let lens = LensState {
//!     field_of_view: 90.0,
//!     aspect_ratio: 1.0,
//!     focus: 2.0,
//!     zoom: 0.0,
//!     k1: 0.0,
//!     k2: 0.0,
//!     center_shift: [0.0, 0.0],
//!     projection_area_width: 10.0,
//!     command: 0,
//! };
//! assert!((lens.focal_length() - 5.0).abs() < 1e-4);
//! ```

mod connection_state;
mod frame;
mod message;
mod snapshot;
mod subject;
mod timecode;
mod update_rate;

pub use connection_state::ConnectionState;
pub use frame::{Frame, ProtocolVersion, RawChunk, WireFormat};
pub use message::{
    COMMAND_FOCUS_DISTANCE, DeviceStatus, DeviceTimestamp, Heartbeat, LensSample, LensState,
    Orientation, ProtocolMessage, SubjectAnnounce, TrackingSample, TrackingState,
};
pub use snapshot::{Snapshot, SubjectStats};
pub use subject::{SubjectId, packet_after, packets_elapsed};
pub use timecode::{MAX_TIMECODE_RATE, QualifiedFrameTime, Timecode};
pub use update_rate::UpdateRate;
