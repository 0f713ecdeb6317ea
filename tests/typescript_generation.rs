//! TypeScript Generation Tests
//!
//! Validates that the snapshot and connection types can be exported to
//! TypeScript when the tauri feature is enabled.

#[cfg(feature = "tauri")]
#[test]
fn test_core_types_implement_specta_type() {
    use specta::Type;

    // If this compiles, all types are properly configured for TypeScript export.
    fn assert_type<T: Type>() {}

    // Consumer-facing state
    assert_type::<stype_link::Snapshot>();
    assert_type::<stype_link::SubjectStats>();
    assert_type::<stype_link::ConnectionState>();
    assert_type::<stype_link::IngestStats>();
    assert_type::<stype_link::UpdateRate>();

    // Device data
    assert_type::<stype_link::TrackingState>();
    assert_type::<stype_link::LensState>();
    assert_type::<stype_link::Orientation>();
    assert_type::<stype_link::Timecode>();
    assert_type::<stype_link::DeviceTimestamp>();
    assert_type::<stype_link::SubjectId>();
}

#[cfg(not(feature = "tauri"))]
#[test]
fn test_tauri_feature_disabled() {
    // Types still compile without specta::Type.
    let _ = stype_link::UpdateRate::Native;
    let _ = stype_link::ConnectionState::Disconnected;
}
