//! Message encoding for both wire formats
//!
//! Used by the rig simulator, benches and tests. Encoding never validates
//! sample values; it only refuses messages a format cannot represent.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    ENVELOPE_HEADER_SIZE, ENVELOPE_SYNC, HF_HEADER, HF_PACKET_SIZE, MAX_ENVELOPE_PAYLOAD, checksum, tag,
};
use crate::types::{
    DeviceTimestamp, LensState, Orientation, ProtocolMessage, ProtocolVersion, SubjectId, TrackingSample,
};
use crate::{Result, TrackingError};

fn put_timestamp(buf: &mut BytesMut, time: &DeviceTimestamp) {
    buf.put_slice(&time.timecode.to_wire());
    buf.put_u8(time.packet_number);
}

fn put_lens(buf: &mut BytesMut, lens: &LensState) {
    for value in [
        lens.field_of_view,
        lens.aspect_ratio,
        lens.focus,
        lens.zoom,
        lens.k1,
        lens.k2,
        lens.center_shift[0],
        lens.center_shift[1],
        lens.projection_area_width,
    ] {
        buf.put_f32_le(value);
    }
}

fn put_string(buf: &mut BytesMut, value: &str, message: &str) -> Result<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| TrackingError::encode(message, format!("{} bytes exceeds the 255-byte limit", value.len())))?;
    buf.put_u8(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Command, timestamp, position, Euler angles and lens: the HF body.
fn put_hf_body(buf: &mut BytesMut, sample: &TrackingSample, message: &str) -> Result<()> {
    let lens = sample
        .lens
        .as_ref()
        .ok_or_else(|| TrackingError::encode(message, "lens state is required"))?;
    let Orientation::Euler { pan, tilt, roll } = sample.tracking.orientation else {
        return Err(TrackingError::encode(message, "HF carries Euler angles only"));
    };

    buf.put_u8(lens.command);
    put_timestamp(buf, &sample.device_time);
    for value in sample.tracking.position {
        buf.put_f32_le(value);
    }
    buf.put_f32_le(pan);
    buf.put_f32_le(tilt);
    buf.put_f32_le(roll);
    put_lens(buf, lens);
    Ok(())
}

/// Encode a tracking sample with lens state as a native 67-byte HF packet.
pub fn encode_hf(sample: &TrackingSample) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HF_PACKET_SIZE);
    buf.put_u8(HF_HEADER);
    put_hf_body(&mut buf, sample, "HF")?;
    let sum = checksum(&buf);
    buf.put_u8(sum);
    debug_assert_eq!(buf.len(), HF_PACKET_SIZE);
    Ok(buf.freeze())
}

/// Wrap an already-encoded body in an envelope frame.
pub fn encode_envelope_raw(version: ProtocolVersion, message_tag: u8, subject: SubjectId, body: &[u8]) -> Result<Bytes> {
    let payload_len = 3 + body.len();
    if payload_len > MAX_ENVELOPE_PAYLOAD {
        return Err(TrackingError::encode(
            "Envelope",
            format!("payload of {} bytes exceeds {}", payload_len, MAX_ENVELOPE_PAYLOAD),
        ));
    }

    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + payload_len + 1);
    buf.put_slice(&ENVELOPE_SYNC);
    buf.put_u8(version.major);
    buf.put_u8(version.minor);
    buf.put_u16_le(payload_len as u16);
    buf.put_u8(message_tag);
    buf.put_u16_le(subject.value());
    buf.put_slice(body);
    let sum = checksum(&buf[ENVELOPE_SYNC.len()..]);
    buf.put_u8(sum);
    Ok(buf.freeze())
}

/// Encode a message as an envelope frame.
///
/// Tracking samples with lens state use the combined camera tag. Without lens
/// state, version 1 needs Euler angles and version 2 needs a quaternion.
pub fn encode_envelope(message: &ProtocolMessage, version: ProtocolVersion) -> Result<Bytes> {
    let mut body = BytesMut::with_capacity(64);

    let (message_tag, subject) = match message {
        ProtocolMessage::Tracking(sample) if sample.lens.is_some() => {
            put_hf_body(&mut body, sample, "Camera")?;
            (tag::CAMERA, sample.subject)
        }
        ProtocolMessage::Tracking(sample) => {
            put_timestamp(&mut body, &sample.device_time);
            for value in sample.tracking.position {
                body.put_f32_le(value);
            }
            match (sample.tracking.orientation, version.major >= 2) {
                (Orientation::Euler { pan, tilt, roll }, false) => {
                    body.put_f32_le(pan);
                    body.put_f32_le(tilt);
                    body.put_f32_le(roll);
                }
                (Orientation::Quaternion { x, y, z, w }, true) => {
                    body.put_f32_le(x);
                    body.put_f32_le(y);
                    body.put_f32_le(z);
                    body.put_f32_le(w);
                }
                (_, true) => {
                    return Err(TrackingError::encode("Tracking", "version 2 carries quaternions"));
                }
                (_, false) => {
                    return Err(TrackingError::encode("Tracking", "version 1 carries Euler angles"));
                }
            }
            (tag::TRACKING, sample.subject)
        }
        ProtocolMessage::Lens(sample) => {
            put_timestamp(&mut body, &sample.device_time);
            body.put_u8(sample.lens.command);
            put_lens(&mut body, &sample.lens);
            (tag::LENS, sample.subject)
        }
        ProtocolMessage::SubjectAnnounce(announce) => {
            put_string(&mut body, &announce.label, "SubjectAnnounce")?;
            (tag::SUBJECT_ANNOUNCE, announce.subject)
        }
        ProtocolMessage::Heartbeat(heartbeat) => {
            put_timestamp(&mut body, &heartbeat.device_time);
            (tag::HEARTBEAT, heartbeat.subject)
        }
        ProtocolMessage::Status(status) => {
            body.put_u16_le(status.code);
            put_string(&mut body, &status.message, "Status")?;
            (tag::STATUS, status.subject)
        }
        ProtocolMessage::Unknown { tag: unknown_tag, .. } => {
            return Err(TrackingError::encode(
                "Unknown",
                format!("payload of tag 0x{:02X} is not retained", unknown_tag),
            ));
        }
    };

    encode_envelope_raw(version, message_tag, subject, &body)
}
