//! Frame to message decoding
//!
//! Decoding is strict about the fields it understands and lenient about
//! everything else: trailing bytes and minor versions are ignored, unknown
//! tags become [`ProtocolMessage::Unknown`]. Floats are read bit-exactly with
//! `f32::from_le_bytes`; non-finite values and impossible lens values are
//! rejected so they never reach a snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::trace;

use super::{HF_HEADER, HF_PACKET_SIZE, SUPPORTED_MAJOR_VERSIONS, supported_versions, tag};
use crate::config::BridgeConfig;
use crate::types::{
    DeviceStatus, DeviceTimestamp, Frame, Heartbeat, LensSample, LensState, Orientation,
    ProtocolMessage, ProtocolVersion, SubjectAnnounce, SubjectId, Timecode, TrackingSample,
    TrackingState, WireFormat,
};
use crate::{Result, TrackingError};

/// Bounds-checked little-endian cursor over a payload.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self { buf, pos: 0, context }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(TrackingError::decode(
                self.context,
                format!(
                    "truncated at byte {}: need {} more, have {}",
                    self.pos,
                    len,
                    self.buf.len() - self.pos
                ),
            ));
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// A finite f32. `field` names the value in the error.
    fn f32(&mut self, field: &str) -> Result<f32> {
        let b = self.take(4)?;
        let value = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if !value.is_finite() {
            return Err(TrackingError::decode(self.context, format!("{} is not finite", field)));
        }
        Ok(value)
    }

    fn timestamp(&mut self) -> Result<DeviceTimestamp> {
        let b = self.take(Timecode::WIRE_SIZE)?;
        let timecode = Timecode::from_wire([b[0], b[1], b[2]]);
        let packet_number = self.u8()?;
        Ok(DeviceTimestamp::new(timecode, packet_number))
    }

    fn string(&mut self, field: &str) -> Result<String> {
        let len = usize::from(self.u8()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            TrackingError::decode(self.context, format!("{} is not valid UTF-8", field))
        })
    }

    fn position(&mut self) -> Result<[f32; 3]> {
        Ok([self.f32("x")?, self.f32("y")?, self.f32("z")?])
    }

    fn euler(&mut self) -> Result<Orientation> {
        Ok(Orientation::Euler { pan: self.f32("pan")?, tilt: self.f32("tilt")?, roll: self.f32("roll")? })
    }

    /// Nine lens floats in wire order, validated.
    fn lens(&mut self, command: u8) -> Result<LensState> {
        let lens = LensState {
            field_of_view: self.f32("field_of_view")?,
            aspect_ratio: self.f32("aspect_ratio")?,
            focus: self.f32("focus")?,
            zoom: self.f32("zoom")?,
            k1: self.f32("k1")?,
            k2: self.f32("k2")?,
            center_shift: [self.f32("center_shift_x")?, self.f32("center_shift_y")?],
            projection_area_width: self.f32("projection_area_width")?,
            command,
        };
        validate_lens(&lens, self.context)?;
        Ok(lens)
    }

    /// HF body: command, timecode, packet number, 15 floats.
    fn hf_body(&mut self, subject: SubjectId) -> Result<TrackingSample> {
        let command = self.u8()?;
        let device_time = self.timestamp()?;
        let position = self.position()?;
        let orientation = self.euler()?;
        let lens = self.lens(command)?;
        Ok(TrackingSample {
            subject,
            device_time,
            tracking: TrackingState { position, orientation },
            lens: Some(lens),
        })
    }
}

fn validate_lens(lens: &LensState, context: &'static str) -> Result<()> {
    if !(lens.field_of_view > 0.0 && lens.field_of_view < 180.0) {
        return Err(TrackingError::decode(
            context,
            format!("field of view {} outside (0, 180)", lens.field_of_view),
        ));
    }
    if lens.aspect_ratio <= 0.0 {
        return Err(TrackingError::decode(
            context,
            format!("aspect ratio {} must be positive", lens.aspect_ratio),
        ));
    }
    if lens.projection_area_width <= 0.0 {
        return Err(TrackingError::decode(
            context,
            format!("projection area width {} must be positive", lens.projection_area_width),
        ));
    }
    Ok(())
}

/// Turns frames into [`ProtocolMessage`]s.
///
/// HF packets carry no subject id; the decoder assigns one from the sender
/// mapping, falling back to the default subject.
#[derive(Debug, Clone)]
pub struct Decoder {
    default_subject: SubjectId,
    senders: HashMap<SocketAddr, SubjectId>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(SubjectId(1))
    }
}

impl Decoder {
    pub fn new(default_subject: SubjectId) -> Self {
        Self { default_subject, senders: HashMap::new() }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        let senders = config
            .subjects
            .iter()
            .filter_map(|m| m.sender)
            .filter_map(|addr| config.subject_for_sender(addr).map(|subject| (addr, subject)))
            .collect();
        Self { default_subject: config.default_subject(), senders }
    }

    /// Bind HF packets from `sender` to `subject`.
    pub fn map_sender(&mut self, sender: SocketAddr, subject: SubjectId) {
        self.senders.insert(sender, subject);
    }

    fn hf_subject(&self, source: Option<SocketAddr>) -> SubjectId {
        source.and_then(|addr| self.senders.get(&addr).copied()).unwrap_or(self.default_subject)
    }

    pub fn decode(&self, frame: &Frame) -> Result<ProtocolMessage> {
        match frame.format {
            WireFormat::Hf => self.decode_hf(&frame.payload, frame.source),
            WireFormat::Envelope => {
                let version = frame.version.ok_or_else(|| {
                    TrackingError::decode("Envelope", "frame carries no protocol version")
                })?;
                self.decode_envelope(version, &frame.payload)
            }
        }
    }

    /// Decode a full 67-byte HF packet. The checksum is the framer's concern.
    pub fn decode_hf(&self, packet: &[u8], source: Option<SocketAddr>) -> Result<ProtocolMessage> {
        if packet.len() < HF_PACKET_SIZE {
            return Err(TrackingError::decode(
                "HF",
                format!("packet is {} bytes, expected {}", packet.len(), HF_PACKET_SIZE),
            ));
        }
        if packet[0] != HF_HEADER {
            return Err(TrackingError::decode("HF", format!("bad header byte 0x{:02X}", packet[0])));
        }
        let mut reader = WireReader::new(&packet[1..HF_PACKET_SIZE - 1], "HF");
        let sample = reader.hf_body(self.hf_subject(source))?;
        trace!(subject = %sample.subject, packet = sample.device_time.packet_number, "decoded HF packet");
        Ok(ProtocolMessage::Tracking(sample))
    }

    /// Decode an envelope payload (`tag`, `subject`, body).
    pub fn decode_envelope(&self, version: ProtocolVersion, payload: &[u8]) -> Result<ProtocolMessage> {
        if !SUPPORTED_MAJOR_VERSIONS.contains(&version.major) {
            return Err(TrackingError::UnsupportedVersion {
                found_major: version.major,
                found_minor: version.minor,
                supported: supported_versions(),
            });
        }

        let mut header = WireReader::new(payload, "Envelope");
        let message_tag = header.u8()?;
        let subject = SubjectId(header.u16()?);
        let body = &payload[header.pos..];

        let message = match message_tag {
            tag::TRACKING => {
                let mut r = WireReader::new(body, "Tracking");
                let device_time = r.timestamp()?;
                let position = r.position()?;
                let orientation = if version.major >= 2 {
                    Orientation::Quaternion {
                        x: r.f32("qx")?,
                        y: r.f32("qy")?,
                        z: r.f32("qz")?,
                        w: r.f32("qw")?,
                    }
                } else {
                    r.euler()?
                };
                ProtocolMessage::Tracking(TrackingSample {
                    subject,
                    device_time,
                    tracking: TrackingState { position, orientation },
                    lens: None,
                })
            }
            tag::LENS => {
                let mut r = WireReader::new(body, "Lens");
                let device_time = r.timestamp()?;
                let command = r.u8()?;
                let lens = r.lens(command)?;
                ProtocolMessage::Lens(LensSample { subject, device_time, lens })
            }
            tag::CAMERA => {
                let mut r = WireReader::new(body, "Camera");
                ProtocolMessage::Tracking(r.hf_body(subject)?)
            }
            tag::SUBJECT_ANNOUNCE => {
                let mut r = WireReader::new(body, "SubjectAnnounce");
                let label = r.string("label")?;
                ProtocolMessage::SubjectAnnounce(SubjectAnnounce { subject, label })
            }
            tag::HEARTBEAT => {
                let mut r = WireReader::new(body, "Heartbeat");
                let device_time = r.timestamp()?;
                ProtocolMessage::Heartbeat(Heartbeat { subject, device_time })
            }
            tag::STATUS => {
                let mut r = WireReader::new(body, "Status");
                let code = r.u16()?;
                let message = r.string("message")?;
                ProtocolMessage::Status(DeviceStatus { subject, code, message })
            }
            other => ProtocolMessage::Unknown { subject: Some(subject), tag: other, payload_len: payload.len() },
        };

        trace!(kind = message.kind(), subject = %subject, version = %version, "decoded envelope message");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubjectMapping;
    use crate::protocol::{Framer, encode_envelope, encode_envelope_raw, encode_hf};
    use crate::test_utils::{sample_lens, sample_tracking};
    use crate::types::{RawChunk, WireFormat};
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::time::Instant;

    fn envelope_frame(bytes: &Bytes) -> Frame {
        let mut framer = Framer::new(WireFormat::Envelope);
        let mut frames = framer.feed(RawChunk::new(bytes.clone(), Instant::now(), None));
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn hf_packet_decodes_all_fields() {
        let sample = sample_tracking(SubjectId(1), 42);
        let packet = encode_hf(&sample).unwrap();
        let decoded = Decoder::default().decode_hf(&packet, None).unwrap();
        assert_eq!(decoded, ProtocolMessage::Tracking(sample));
    }

    #[test]
    fn hf_fixed_layout() {
        // Header, command 0x02, timecode 01:02:03:04, packet 200, then floats.
        let mut packet = vec![0x0F, 0x02];
        packet.extend_from_slice(&Timecode::new(1, 2, 3, 4).to_wire());
        packet.push(200);
        let floats: [f32; 15] =
            [1.5, -2.0, 3.25, 10.0, -5.0, 0.5, 45.0, 1.7777, 2.5, 0.3, 0.01, -0.02, 0.1, -0.1, 9.59];
        for f in floats {
            packet.extend_from_slice(&f.to_le_bytes());
        }
        packet.push(crate::protocol::checksum(&packet));
        assert_eq!(packet.len(), HF_PACKET_SIZE);

        let ProtocolMessage::Tracking(sample) = Decoder::default().decode_hf(&packet, None).unwrap() else {
            panic!("expected tracking");
        };
        assert_eq!(sample.subject, SubjectId(1));
        assert_eq!(sample.device_time.timecode, Timecode::new(1, 2, 3, 4));
        assert_eq!(sample.device_time.packet_number, 200);
        assert_eq!(sample.tracking.position, [1.5, -2.0, 3.25]);
        assert_eq!(sample.tracking.orientation, Orientation::Euler { pan: 10.0, tilt: -5.0, roll: 0.5 });
        let lens = sample.lens.unwrap();
        assert_eq!(lens.field_of_view, 45.0);
        assert_eq!(lens.aspect_ratio, 1.7777);
        assert_eq!(lens.center_shift, [0.1, -0.1]);
        assert_eq!(lens.projection_area_width, 9.59);
        assert!(lens.focus_distance_valid());
    }

    #[test]
    fn hf_subject_follows_sender_mapping() {
        let sender: SocketAddr = "10.1.1.5:4000".parse().unwrap();
        let mut decoder = Decoder::new(SubjectId(1));
        decoder.map_sender(sender, SubjectId(8));
        let packet = encode_hf(&sample_tracking(SubjectId(1), 1)).unwrap();

        let mapped = decoder.decode_hf(&packet, Some(sender)).unwrap();
        let other = decoder.decode_hf(&packet, Some("10.1.1.6:4000".parse().unwrap())).unwrap();
        assert_eq!(mapped.subject(), Some(SubjectId(8)));
        assert_eq!(other.subject(), Some(SubjectId(1)));
    }

    #[test]
    fn configured_senders_resolve_like_the_config() {
        let crane: SocketAddr = "10.0.0.8:6301".parse().unwrap();
        let dolly: SocketAddr = "10.0.0.9:6301".parse().unwrap();
        let config = BridgeConfig {
            subjects: vec![
                SubjectMapping { id: 2, label: None, sender: Some(crane) },
                SubjectMapping { id: 5, label: Some("Dolly".into()), sender: Some(dolly) },
                // Shadowed: the first mapping for a sender wins.
                SubjectMapping { id: 9, label: None, sender: Some(crane) },
                SubjectMapping { id: 7, label: Some("Jib".into()), sender: None },
            ],
            ..BridgeConfig::udp("0.0.0.0", 6301)
        };
        let decoder = Decoder::from_config(&config);
        let packet = encode_hf(&sample_tracking(SubjectId(1), 1)).unwrap();

        for sender in [crane, dolly] {
            let decoded = decoder.decode_hf(&packet, Some(sender)).unwrap();
            assert_eq!(decoded.subject(), config.subject_for_sender(sender));
        }
        assert_eq!(decoder.decode_hf(&packet, Some(crane)).unwrap().subject(), Some(SubjectId(2)));
        let unknown = decoder.decode_hf(&packet, Some("10.0.0.10:6301".parse().unwrap())).unwrap();
        assert_eq!(unknown.subject(), Some(config.default_subject()));
    }

    #[test]
    fn non_finite_and_out_of_range_lens_values_are_rejected() {
        let mut sample = sample_tracking(SubjectId(1), 1);
        let decoder = Decoder::default();

        let mut packet = encode_hf(&sample).unwrap().to_vec();
        // Overwrite X with NaN.
        packet[6..10].copy_from_slice(&f32::NAN.to_le_bytes());
        let err = decoder.decode_hf(&packet, None).unwrap_err();
        assert!(err.to_string().contains("x is not finite"));

        if let Some(lens) = sample.lens.as_mut() {
            lens.field_of_view = 180.0;
        }
        let packet = encode_hf(&sample).unwrap();
        assert!(matches!(decoder.decode_hf(&packet, None), Err(TrackingError::Decode { .. })));
    }

    #[test]
    fn envelope_versions_pick_orientation_encoding() {
        let decoder = Decoder::default();
        let mut sample = sample_tracking(SubjectId(5), 3);
        sample.lens = None;

        let v1 = encode_envelope(&ProtocolMessage::Tracking(sample.clone()), ProtocolVersion::V1).unwrap();
        assert_eq!(decoder.decode(&envelope_frame(&v1)).unwrap(), ProtocolMessage::Tracking(sample.clone()));

        sample.tracking.orientation = Orientation::Quaternion { x: 0.0, y: 0.7071, z: 0.0, w: 0.7071 };
        let v2 = encode_envelope(&ProtocolMessage::Tracking(sample.clone()), ProtocolVersion::V2).unwrap();
        assert_eq!(decoder.decode(&envelope_frame(&v2)).unwrap(), ProtocolMessage::Tracking(sample));
    }

    #[test]
    fn unsupported_major_version_is_rejected() {
        let bytes = encode_envelope_raw(ProtocolVersion::new(3, 1), tag::HEARTBEAT, SubjectId(1), &[0; 4]).unwrap();
        let err = Decoder::default().decode(&envelope_frame(&bytes)).unwrap_err();
        match err {
            TrackingError::UnsupportedVersion { found_major, found_minor, .. } => {
                assert_eq!((found_major, found_minor), (3, 1));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_tags_and_trailing_bytes_are_tolerated() {
        let decoder = Decoder::default();
        let unknown = encode_envelope_raw(ProtocolVersion::new(2, 7), 0x55, SubjectId(9), &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            decoder.decode(&envelope_frame(&unknown)).unwrap(),
            ProtocolMessage::Unknown { subject: Some(SubjectId(9)), tag: 0x55, payload_len: 7 }
        );

        let mut body = Timecode::new(0, 0, 1, 2).to_wire().to_vec();
        body.push(17);
        body.extend_from_slice(&[0xEE; 5]);
        let heartbeat = encode_envelope_raw(ProtocolVersion::V1, tag::HEARTBEAT, SubjectId(2), &body).unwrap();
        let ProtocolMessage::Heartbeat(hb) = decoder.decode(&envelope_frame(&heartbeat)).unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(hb.device_time.packet_number, 17);
    }

    #[test]
    fn truncated_bodies_are_decode_errors() {
        let bytes = encode_envelope_raw(ProtocolVersion::V1, tag::LENS, SubjectId(1), &[0; 10]).unwrap();
        let err = Decoder::default().decode(&envelope_frame(&bytes)).unwrap_err();
        assert!(matches!(err, TrackingError::Decode { ref message, .. } if message == "Lens"));
    }

    #[test]
    fn announce_and_status_strings() {
        let decoder = Decoder::default();
        let announce = ProtocolMessage::SubjectAnnounce(SubjectAnnounce { subject: SubjectId(4), label: "Jib".into() });
        let status = ProtocolMessage::Status(DeviceStatus { subject: SubjectId(4), code: 17, message: "encoder fault".into() });

        for message in [announce, status] {
            let bytes = encode_envelope(&message, ProtocolVersion::V1).unwrap();
            assert_eq!(decoder.decode(&envelope_frame(&bytes)).unwrap(), message);
        }

        let bad_utf8 = encode_envelope_raw(ProtocolVersion::V1, tag::SUBJECT_ANNOUNCE, SubjectId(4), &[2, 0xC3, 0x28]).unwrap();
        assert!(decoder.decode(&envelope_frame(&bad_utf8)).is_err());
    }

    #[test]
    fn lens_message_round_trip() {
        let decoder = Decoder::default();
        let message = ProtocolMessage::Lens(sample_lens(SubjectId(6), 77));
        let bytes = encode_envelope(&message, ProtocolVersion::V1).unwrap();
        assert_eq!(decoder.decode(&envelope_frame(&bytes)).unwrap(), message);
    }

    proptest! {
        #[test]
        fn camera_messages_are_bit_exact(
            position in prop::array::uniform3(-1000.0f32..1000.0),
            angles in prop::array::uniform3(-180.0f32..180.0),
            fov in 1.0f32..170.0,
            focus in 0.0f32..100.0,
            k in prop::array::uniform2(-1.0f32..1.0),
            packet in any::<u8>(),
            subject in any::<u16>(),
        ) {
            let mut sample = sample_tracking(SubjectId(subject), packet);
            sample.tracking.position = position;
            sample.tracking.orientation = Orientation::Euler { pan: angles[0], tilt: angles[1], roll: angles[2] };
            if let Some(lens) = sample.lens.as_mut() {
                lens.field_of_view = fov;
                lens.focus = focus;
                lens.k1 = k[0];
                lens.k2 = k[1];
            }

            let bytes = encode_envelope(&ProtocolMessage::Tracking(sample.clone()), ProtocolVersion::V1).unwrap();
            let decoded = Decoder::default().decode(&envelope_frame(&bytes)).unwrap();
            let ProtocolMessage::Tracking(decoded) = decoded else {
                return Err(TestCaseError::fail("expected tracking"));
            };
            prop_assert_eq!(decoded.tracking.position.map(f32::to_bits), position.map(f32::to_bits));
            prop_assert_eq!(decoded, sample);
        }
    }
}
