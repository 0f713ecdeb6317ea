//! Integration tests for the connection layer
//!
//! These drive full connections over loopback UDP and the in-memory
//! transport and check what a consumer observes.

use super::*;
use crate::TrackingError;
use crate::config::SubjectMapping;
use crate::protocol::{encode_envelope, encode_hf};
use crate::test_utils::{BASE_FRAME, SAMPLE_RATE, sample_tracking, tracking_at};
use crate::transport::{MemorySink, MemoryTransport};
use crate::types::{ProtocolMessage, ProtocolVersion, WireFormat};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::info;

fn envelope_config() -> BridgeConfig {
    BridgeConfig { format: WireFormat::Envelope, ..BridgeConfig::default() }
}

fn camera_frame(subject: u16, frame: i64) -> bytes::Bytes {
    let sample = tracking_at(SubjectId(subject), BASE_FRAME + frame, SAMPLE_RATE);
    encode_envelope(&ProtocolMessage::Tracking(sample), ProtocolVersion::V1).unwrap()
}

async fn memory_connection(config: BridgeConfig) -> (MemorySink, TrackingConnection) {
    let (sink, transport) = MemoryTransport::channel(256);
    let connection = TrackingConnection::with_transport(config, transport).await.unwrap();
    (sink, connection)
}

/// Wait until `check` holds for the published state.
async fn published(connection: &TrackingConnection, check: impl Fn(&TrackingConnection) -> bool) {
    let mut reader = connection.reader();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check(connection) {
            let _ = tokio::time::timeout(Duration::from_millis(50), reader.changed()).await;
        }
    })
    .await
    .expect("published state never matched");
}

#[tokio::test]
async fn invalid_configuration_is_rejected_synchronously() {
    let config = BridgeConfig { staleness_timeout_ms: 0, ..BridgeConfig::default() };
    let err = TrackingConnection::connect(config).await.unwrap_err();
    assert!(matches!(err, TrackingError::Configuration { ref field, .. } if field == "staleness_timeout_ms"));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn udp_bind_failure_surfaces_from_connect() {
    let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let err = TrackingConnection::connect(BridgeConfig::udp("127.0.0.1", port)).await.unwrap_err();
    assert!(matches!(err, TrackingError::Transport { .. }));
}

#[tokio::test]
async fn hf_datagrams_become_snapshots() {
    let _ = tracing_subscriber::fmt::try_init();

    let connection = TrackingConnection::connect(BridgeConfig::udp("127.0.0.1", 0)).await.unwrap();
    let target = connection.local_addr().expect("UDP connection is bound");
    assert_eq!(connection.status(), ConnectionState::Connected);
    assert!(connection.read(SubjectId(1)).is_none());

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for packet in 0..3u8 {
        sender.send_to(&encode_hf(&sample_tracking(SubjectId(1), packet)).unwrap(), target).await.unwrap();
    }

    published(&connection, |c| c.read(SubjectId(1)).is_some_and(|s| s.stats.accepted == 3)).await;
    let snapshot = connection.read(SubjectId(1)).unwrap();
    info!(snapshot = ?snapshot, "received");
    assert_eq!(snapshot.label.as_deref(), Some("Camera"));
    assert_eq!(snapshot.device_time.packet_number, 2);
    assert!(snapshot.timestamp >= 0.0);
    assert_eq!(connection.stats().frames, 3);
}

#[tokio::test]
async fn sender_mapping_splits_hf_subjects() {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = BridgeConfig {
        subjects: vec![
            SubjectMapping { id: 10, label: Some("Crane".into()), sender: Some(a.local_addr().unwrap()) },
            SubjectMapping { id: 11, label: Some("Dolly".into()), sender: Some(b.local_addr().unwrap()) },
        ],
        ..BridgeConfig::udp("127.0.0.1", 0)
    };
    let connection = TrackingConnection::connect(config).await.unwrap();
    let target = connection.local_addr().unwrap();

    let packet = encode_hf(&sample_tracking(SubjectId(1), 1)).unwrap();
    a.send_to(&packet, target).await.unwrap();
    b.send_to(&packet, target).await.unwrap();

    published(&connection, |c| c.read_all().len() == 2).await;
    let labels: Vec<String> = connection.read_all().iter().map(|s| s.display_name()).collect();
    assert_eq!(labels, vec!["Crane", "Dolly"]);
}

#[tokio::test]
async fn stale_subjects_leave_and_rejoin_read_all() {
    let config = BridgeConfig { staleness_timeout_ms: 150, sweep_interval_ms: 10, ..envelope_config() };
    let (sink, connection) = memory_connection(config).await;

    sink.send(camera_frame(1, 0), None).await.unwrap();
    sink.send(camera_frame(2, 0), None).await.unwrap();
    published(&connection, |c| c.read_all().len() == 2).await;

    // Only subject 2 keeps talking.
    for frame in 1..=30 {
        sink.send(camera_frame(2, frame), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    published(&connection, |c| c.read_all().len() == 1).await;
    assert_eq!(connection.read_all()[0].subject, SubjectId(2));
    assert!(connection.read(SubjectId(1)).unwrap().stale);

    sink.send(camera_frame(1, 40), None).await.unwrap();
    sink.send(camera_frame(2, 31), None).await.unwrap();
    published(&connection, |c| c.read_all().len() == 2).await;
    let back = connection.read(SubjectId(1)).unwrap();
    assert!(!back.stale);
    assert_eq!(back.device_time.packet_number, 40);
}

#[tokio::test]
async fn disconnect_stops_publication() {
    let (sink, mut connection) = memory_connection(envelope_config()).await;
    let mut states = Box::pin(connection.status_updates());

    sink.send(camera_frame(3, 0), None).await.unwrap();
    published(&connection, |c| c.read(SubjectId(3)).is_some()).await;

    connection.disconnect().await;
    assert_eq!(connection.status(), ConnectionState::Disconnected);
    let generation = connection.reader().table().generation();

    sink.send(camera_frame(3, 1), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connection.reader().table().generation(), generation);
    // The last value stays readable.
    assert_eq!(connection.read(SubjectId(3)).unwrap().device_time.packet_number, 0);

    // Disconnecting twice is harmless.
    connection.disconnect().await;

    let mut seen = Vec::new();
    while let Ok(Some(state)) = tokio::time::timeout(Duration::from_millis(50), states.next()).await {
        seen.push(state);
    }
    assert_eq!(seen.last(), Some(&ConnectionState::Disconnected));
}

#[tokio::test]
async fn reconfigure_keeps_subjects_and_applies_labels() {
    let (sink, mut connection) = memory_connection(envelope_config()).await;
    sink.send(camera_frame(5, 0), None).await.unwrap();
    published(&connection, |c| c.read(SubjectId(5)).is_some()).await;

    let invalid = BridgeConfig { default_frame_rate: 500, ..envelope_config() };
    assert!(connection.reconfigure(invalid).await.is_err());
    assert_eq!(connection.status(), ConnectionState::Connected);

    let relabelled = BridgeConfig {
        subjects: vec![SubjectMapping { id: 5, label: Some("Jib".into()), sender: None }],
        ..envelope_config()
    };
    connection.reconfigure(relabelled).await.unwrap();

    sink.send(camera_frame(5, 1), None).await.unwrap();
    published(&connection, |c| c.read(SubjectId(5)).is_some_and(|s| s.device_time.packet_number == 1)).await;
    let snapshot = connection.read(SubjectId(5)).unwrap();
    assert_eq!(snapshot.label.as_deref(), Some("Jib"));
    assert_eq!(snapshot.stats.accepted, 2);
    assert_eq!(snapshot.version, 2);
}

#[tokio::test]
async fn throttled_subscription_delivers_latest() {
    let (sink, connection) = memory_connection(envelope_config()).await;
    let mut updates = Box::pin(connection.subscribe(UpdateRate::Max(10)));

    sink.send(camera_frame(1, 0), None).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), updates.next()).await.unwrap().unwrap();
    assert_eq!(first.len(), 1);

    for frame in 1..=5 {
        sink.send(camera_frame(1, frame), None).await.unwrap();
    }
    published(&connection, |c| c.read(SubjectId(1)).is_some_and(|s| s.stats.accepted == 6)).await;

    let latest = tokio::time::timeout(Duration::from_secs(2), updates.next()).await.unwrap().unwrap();
    assert_eq!(latest[0].device_time.packet_number, 5);
}

#[tokio::test]
async fn dropped_connection_cancels_its_task() {
    let (sink, connection) = memory_connection(envelope_config()).await;
    let reader = connection.reader();
    drop(connection);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The task has exited, so nothing drains the channel any more.
    let _ = sink.send(camera_frame(1, 0), None).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(reader.read(SubjectId(1)).is_none());
}
