//! Connection configuration
//!
//! [`BridgeConfig`] describes one endpoint: where to listen or connect, how
//! the bytes are framed, how subjects are named, and the timing knobs for
//! staleness, reconnects and clock reconciliation. Every field has a default,
//! so a YAML file only needs the values that differ:
//!
//! ```yaml
//! port: 6301
//! mode: tcp
//! format: envelope
//! subjects:
//!   - id: 2
//!     label: Crane
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::types::{MAX_TIMECODE_RATE, SubjectId, WireFormat};
use crate::{Result, TrackingError};

/// UDP port the HF protocol streams to by default.
pub const DEFAULT_PORT: u16 = 54321;

/// Smallest receive buffer that still fits a full envelope frame.
pub const MIN_RECV_BUFFER: usize = 2048;

/// Socket type for the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Udp,
    Tcp,
}

/// Names a protocol subject and optionally binds it to a sender.
///
/// HF packets carry no subject id, so a sender mapping is how several rigs
/// streaming to one port are told apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct SubjectMapping {
    pub id: u16,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub sender: Option<SocketAddr>,
}

/// TCP reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed attempts before the connection faults. 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { initial_backoff_ms: 100, max_backoff_ms: 5_000, max_attempts: 10 }
    }
}

impl ReconnectPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Device clock reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(default)]
pub struct ClockSettings {
    /// Weight of each new offset observation, in (0, 1]
    pub smoothing: f64,
    /// Device time jumps larger than this re-anchor the timeline
    pub reset_tolerance_ms: u64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self { smoothing: 0.05, reset_tolerance_ms: 500 }
    }
}

impl ClockSettings {
    pub fn reset_tolerance(&self) -> Duration {
        Duration::from_millis(self.reset_tolerance_ms)
    }
}

/// Configuration for one tracking connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(default)]
pub struct BridgeConfig {
    /// Bind address for UDP, remote host for TCP
    pub host: String,
    /// 0 binds an ephemeral UDP port
    pub port: u16,
    pub mode: TransportMode,
    pub format: WireFormat,
    /// Only accept datagrams from this address
    pub sender_filter: Option<IpAddr>,
    pub subjects: Vec<SubjectMapping>,
    /// Subject assigned to HF packets from unmapped senders
    pub default_subject: u16,
    pub default_label: String,
    pub staleness_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub clock: ClockSettings,
    /// Timecode rate assumed until one is inferred from the stream
    pub default_frame_rate: u32,
    pub recv_buffer_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            mode: TransportMode::Udp,
            format: WireFormat::Hf,
            sender_filter: None,
            subjects: Vec::new(),
            default_subject: 1,
            default_label: "Camera".to_string(),
            staleness_timeout_ms: 1_500,
            sweep_interval_ms: 100,
            connect_timeout_ms: 2_000,
            reconnect: ReconnectPolicy::default(),
            clock: ClockSettings::default(),
            default_frame_rate: 60,
            recv_buffer_size: 64 * 1024,
        }
    }
}

impl BridgeConfig {
    /// UDP listener on `host:port` with defaults for everything else.
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, ..Self::default() }
    }

    /// TCP client for `host:port`, envelope framed.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            mode: TransportMode::Tcp,
            format: WireFormat::Envelope,
            ..Self::default()
        }
    }

    /// Parse a configuration from YAML and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BridgeConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            TrackingError::configuration("path", format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// `host:port` as used in logs and errors.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn default_subject(&self) -> SubjectId {
        SubjectId(self.default_subject)
    }

    /// Configured label for a subject. The default subject falls back to
    /// `default_label`.
    pub fn label_for(&self, subject: SubjectId) -> Option<String> {
        self.subjects
            .iter()
            .find(|m| m.id == subject.value())
            .and_then(|m| m.label.clone())
            .or_else(|| {
                (subject == self.default_subject() && !self.default_label.is_empty())
                    .then(|| self.default_label.clone())
            })
    }

    /// Subject bound to a sender address, if any mapping names it.
    pub fn subject_for_sender(&self, sender: SocketAddr) -> Option<SubjectId> {
        self.subjects.iter().find(|m| m.sender == Some(sender)).map(|m| SubjectId(m.id))
    }

    /// Check every field. Nothing is connected with an invalid configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TrackingError::configuration("host", "must not be empty"));
        }
        if self.mode == TransportMode::Tcp && self.port == 0 {
            return Err(TrackingError::configuration("port", "TCP needs a remote port"));
        }
        if self.default_frame_rate == 0 || self.default_frame_rate > MAX_TIMECODE_RATE {
            return Err(TrackingError::configuration(
                "default_frame_rate",
                format!("must be within 1..={}", MAX_TIMECODE_RATE),
            ));
        }
        if self.staleness_timeout_ms == 0 {
            return Err(TrackingError::configuration("staleness_timeout_ms", "must be positive"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(TrackingError::configuration("sweep_interval_ms", "must be positive"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(TrackingError::configuration("connect_timeout_ms", "must be positive"));
        }
        if self.reconnect.initial_backoff_ms == 0 {
            return Err(TrackingError::configuration(
                "reconnect.initial_backoff_ms",
                "must be positive",
            ));
        }
        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return Err(TrackingError::configuration(
                "reconnect.max_backoff_ms",
                "must not be below initial_backoff_ms",
            ));
        }
        if !(self.clock.smoothing > 0.0 && self.clock.smoothing <= 1.0) {
            return Err(TrackingError::configuration("clock.smoothing", "must be within (0, 1]"));
        }
        if self.recv_buffer_size < MIN_RECV_BUFFER {
            return Err(TrackingError::configuration(
                "recv_buffer_size",
                format!("must be at least {} bytes", MIN_RECV_BUFFER),
            ));
        }

        let mut ids = HashSet::new();
        let mut senders = HashSet::new();
        for mapping in &self.subjects {
            if !ids.insert(mapping.id) {
                return Err(TrackingError::configuration(
                    "subjects",
                    format!("subject id {} mapped twice", mapping.id),
                ));
            }
            if let Some(sender) = mapping.sender {
                if !senders.insert(sender) {
                    return Err(TrackingError::configuration(
                        "subjects",
                        format!("sender {} mapped to more than one subject", sender),
                    ));
                }
            }
        }

        Ok(())
    }
}
