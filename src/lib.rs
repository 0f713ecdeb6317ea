//! Live-data bridge for Stype HF camera-tracking telemetry.
//!
//! Stype Link listens for the tracking stream a Stype rig sends over UDP (or
//! reads it from a TCP link), frames and decodes it, reconciles each camera's
//! device clock onto one local timeline and publishes an immutable
//! [`Snapshot`] per camera that any number of readers can take without
//! blocking ingestion.
//!
//! # Features
//!
//! - **Transports**: UDP with sender filtering, TCP with reconnect and backoff
//! - **Framing**: HF packets and the versioned envelope, resynchronising on corruption
//! - **Timing**: timecode and packet rates inferred from the stream, robust to loss
//! - **Lock-free reads**: one atomic swap per batch, consistent multi-subject views
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stype_link::{StypeLink, SubjectId, UpdateRate};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> stype_link::Result<()> {
//!     let connection = StypeLink::listen(6301).await?;
//!
//!     let mut updates = Box::pin(connection.subscribe(UpdateRate::Max(30)));
//!     while let Some(snapshots) = updates.next().await {
//!         for camera in snapshots {
//!             println!("{}: {:?}", camera.display_name(), camera.tracking);
//!         }
//!     }
//!
//!     // Or poll the latest value directly.
//!     let _ = connection.read(SubjectId(1));
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Wire protocol and timing
pub mod clock;
pub mod protocol;
pub mod registry;

// Ingestion pipeline and consumer surface
pub mod connection;
pub mod driver;
pub mod publisher;
pub mod sim;
pub mod stream;
pub mod transport;

// Core exports
pub use error::*;
pub use types::*;

// Main API exports
pub use config::{BridgeConfig, ClockSettings, ReconnectPolicy, SubjectMapping, TransportMode};
pub use connection::TrackingConnection;
pub use driver::IngestStats;
pub use publisher::{SnapshotReader, SnapshotTable};
pub use sim::RigSimulator;
pub use transport::Transport;

/// Unified entry point for tracking connections.
///
/// # Examples
///
/// ## Listen for a rig on UDP
/// ```rust,no_run
/// use stype_link::StypeLink;
///
/// #[tokio::main]
/// async fn main() -> stype_link::Result<()> {
///     let connection = StypeLink::listen(6301).await?;
///     println!("listening on {:?}", connection.local_addr());
///     Ok(())
/// }
/// ```
///
/// ## Configuration file
/// ```rust,no_run
/// use stype_link::StypeLink;
///
/// #[tokio::main]
/// async fn main() -> stype_link::Result<()> {
///     let connection = StypeLink::open("stage.yaml").await?;
///     println!("{:?}", connection.status());
///     Ok(())
/// }
/// ```
pub struct StypeLink;

impl StypeLink {
    /// Listen for HF datagrams on every interface at `port`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the port cannot be bound.
    pub async fn listen(port: u16) -> Result<TrackingConnection> {
        TrackingConnection::connect(BridgeConfig::udp("0.0.0.0", port)).await
    }

    /// Connect with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid settings and a transport
    /// error if a UDP socket cannot be bound. TCP failures are reported
    /// through [`TrackingConnection::status`].
    pub async fn connect(config: BridgeConfig) -> Result<TrackingConnection> {
        TrackingConnection::connect(config).await
    }

    /// Load a YAML configuration file and connect with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or any error
    /// [`connect`](Self::connect) returns.
    pub async fn open<P: AsRef<std::path::Path>>(path: P) -> Result<TrackingConnection> {
        let config = BridgeConfig::load(path)?;
        TrackingConnection::connect(config).await
    }
}
