//! Error types for camera-tracking ingestion.
//!
//! Every failure the bridge can observe is a variant of [`TrackingError`]. Most
//! of them never leave the ingestion task: framing, decode and reconciliation
//! problems are logged and counted, and the stream keeps flowing. Only
//! configuration problems and socket setup failures surface to the caller of
//! [`TrackingConnection::connect`](crate::TrackingConnection::connect).
//!
//! ## Error Categories
//!
//! - **Transport Errors**: bind, connect or read failures on the socket
//! - **Framing Errors**: sync loss or corruption in the byte stream
//! - **Decode Errors**: malformed payloads of known message types
//! - **Version Errors**: envelope frames from an unsupported major version
//! - **Reconciliation Errors**: device clock regressions
//! - **Configuration Errors**: invalid endpoint or parameters
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use stype_link::TrackingError;
//!
//! let error = TrackingError::connection_failed("127.0.0.1:54321", "connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for tracking operations.
pub type Result<T, E = TrackingError> = std::result::Result<T, E>;

/// Main error type for tracking ingestion.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrackingError {
    #[error("Transport error on {endpoint}: {operation}")]
    Transport {
        operation: String,
        endpoint: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Framing error: {reason} ({discarded} bytes discarded)")]
    Framing { reason: String, discarded: usize },

    #[error("Decode error in {message}: {details}")]
    Decode { message: String, details: String },

    #[error("Unsupported protocol version {found_major}.{found_minor} (supported major versions: {supported})")]
    UnsupportedVersion { found_major: u8, found_minor: u8, supported: String },

    #[error("Timestamp reconciliation anomaly for subject {subject}: {details}")]
    Reconciliation { subject: u16, details: String },

    #[error("Cannot encode {message}: {details}")]
    Encode { message: String, details: String },

    #[error("Invalid configuration for '{field}': {reason}")]
    Configuration { field: String, reason: String },

    #[error("Failed to parse configuration")]
    Yaml {
        #[source]
        source: serde_yaml_ng::Error,
    },
}

impl TrackingError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TrackingError::Transport { .. } => true,
            TrackingError::Timeout { .. } => true,
            TrackingError::Framing { .. } => true,
            TrackingError::Decode { .. } => false,
            TrackingError::UnsupportedVersion { .. } => false,
            TrackingError::Reconciliation { .. } => true,
            TrackingError::Encode { .. } => false,
            TrackingError::Configuration { .. } => false,
            TrackingError::Yaml { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            TrackingError::Transport { .. } => vec![
                "Check that the tracking rig is powered and streaming",
                "Verify the configured host and port match the rig output",
                "Check firewall rules for the tracking port",
                "Make sure no other process is bound to the same UDP port",
            ],
            TrackingError::Timeout { .. } => vec![
                "Increase the connect timeout",
                "Check network latency to the tracking rig",
                "Verify the rig accepts TCP connections on this port",
            ],
            TrackingError::Framing { .. } => vec![
                "Verify the configured wire format matches the rig output",
                "Check for other senders on the same port",
                "Inspect the link for packet corruption",
            ],
            TrackingError::Decode { .. } => vec![
                "Verify the rig firmware speaks the HF protocol",
                "Check lens calibration values on the rig",
                "Capture the offending packets for inspection",
            ],
            TrackingError::UnsupportedVersion { .. } => vec![
                "Update the library to a version supporting this protocol",
                "Configure the sender to emit a supported major version",
            ],
            TrackingError::Reconciliation { .. } => vec![
                "Check the timecode source feeding the rig",
                "Increase the clock reset tolerance",
            ],
            TrackingError::Encode { .. } => vec![
                "Use the envelope format for messages HF cannot carry",
                "Provide lens state and Euler orientation for HF packets",
            ],
            TrackingError::Configuration { .. } => vec![
                "Check the field named in the error",
                "Compare against BridgeConfig::default() values",
                "Fix the configuration and reconnect",
            ],
            TrackingError::Yaml { .. } => vec![
                "Check the configuration file syntax",
                "Verify field names match BridgeConfig",
            ],
        }
    }

    /// Helper constructor for transport errors without an io source.
    pub fn transport(operation: impl Into<String>, endpoint: impl Into<String>) -> Self {
        TrackingError::Transport { operation: operation.into(), endpoint: endpoint.into(), source: None }
    }

    /// Helper constructor for transport errors caused by an io failure.
    pub fn transport_io(
        operation: impl Into<String>,
        endpoint: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        TrackingError::Transport {
            operation: operation.into(),
            endpoint: endpoint.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for a refused or failed connection attempt.
    pub fn connection_failed(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        TrackingError::Transport {
            operation: format!("connect failed: {}", reason.into()),
            endpoint: endpoint.into(),
            source: None,
        }
    }

    /// Helper constructor for framing errors.
    pub fn framing(reason: impl Into<String>, discarded: usize) -> Self {
        TrackingError::Framing { reason: reason.into(), discarded }
    }

    /// Helper constructor for decode errors.
    pub fn decode(message: impl Into<String>, details: impl Into<String>) -> Self {
        TrackingError::Decode { message: message.into(), details: details.into() }
    }

    /// Helper constructor for encode errors.
    pub fn encode(message: impl Into<String>, details: impl Into<String>) -> Self {
        TrackingError::Encode { message: message.into(), details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        TrackingError::Configuration { field: field.into(), reason: reason.into() }
    }

    /// Helper constructor for reconciliation anomalies.
    pub fn reconciliation(subject: u16, details: impl Into<String>) -> Self {
        TrackingError::Reconciliation { subject, details: details.into() }
    }
}

impl From<serde_yaml_ng::Error> for TrackingError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        TrackingError::Yaml { source: err }
    }
}
