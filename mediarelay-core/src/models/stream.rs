//! Stream lineage records
//!
//! A lineage is every record sharing one `provenance_stream_id`: the camera
//! origin plus each RTMP relay hop that republishes it. Records are keyed by
//! `(stream_id, destination_server_id)` because a relay toward another server
//! reuses the upstream hop's id with a new destination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Origin (device fed) or relay hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Camera,
    Rtmp,
}

impl StreamKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Rtmp => "rtmp",
        }
    }
}

impl FromStr for StreamKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "camera" => Ok(Self::Camera),
            "rtmp" => Ok(Self::Rtmp),
            other => Err(Error::InvalidInput(format!("Unknown stream kind: {other}"))),
        }
    }
}

/// Transport of the stream URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamType {
    Rtmp,
    Rtsp,
    Hls,
    Other,
}

impl StreamType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rtmp => "RTMP",
            Self::Rtsp => "RTSP",
            Self::Hls => "HLS",
            Self::Other => "OTHER",
        }
    }
}

impl Default for StreamType {
    fn default() -> Self {
        Self::Rtsp
    }
}

impl FromStr for StreamType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RTMP" => Ok(Self::Rtmp),
            "RTSP" => Ok(Self::Rtsp),
            "HLS" => Ok(Self::Hls),
            "OTHER" => Ok(Self::Other),
            other => Err(Error::InvalidInput(format!("Unknown stream type: {other}"))),
        }
    }
}

/// Relay process state of a hop.
///
/// The orchestrator moves hops `Pending -> Running | Failed` on creation and
/// `-> Stopped` on teardown. The status poller owns every other transition,
/// including retrying `Failed` hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HopState {
    Pending,
    Running,
    Failed,
    Stopped,
}

impl HopState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl Default for HopState {
    fn default() -> Self {
        Self::Pending
    }
}

impl FromStr for HopState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(Error::InvalidInput(format!("Unknown hop state: {other}"))),
        }
    }
}

/// Caller supplied description of a camera stream to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDraft {
    pub camera_id: String,
    pub stream_name: String,
    pub stream_url: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub stream_type: StreamType,
}

impl RegisterDraft {
    /// Reject drafts that cannot produce a usable origin record.
    pub fn validate(&self) -> Result<()> {
        if self.camera_id.trim().is_empty() {
            return Err(Error::InvalidInput("cameraId must not be empty".to_string()));
        }
        if self.stream_name.trim().is_empty() {
            return Err(Error::InvalidInput("streamName must not be empty".to_string()));
        }
        match self.stream_url.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(()),
            _ => Err(Error::InvalidInput(format!(
                "streamUrl must be an absolute URL: {}",
                self.stream_url
            ))),
        }
    }
}

/// Counters maintained by the status subsystem. Read-only here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamTelemetry {
    pub codec: Option<String>,
    pub resolution: Option<String>,
    pub frame_rate: Option<f64>,
    pub bandwidth_in: i64,
    pub bandwidth_out: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub total_clients: i32,
    pub active_time: i64,
    pub last_active: Option<DateTime<Utc>>,
}

/// One hop of a replication lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub stream_id: String,
    pub provenance_stream_id: String,
    pub user_id: String,
    pub camera_id: String,
    pub source_server_id: String,
    pub destination_server_id: String,
    #[serde(default)]
    pub process_id: Option<u32>,
    pub stream_name: String,
    pub stream_url: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub stream_type: StreamType,
    pub is_public: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_publishing: bool,
    #[serde(default)]
    pub is_stable: bool,
    #[serde(default)]
    pub relay_state: HopState,
    #[serde(default)]
    pub telemetry: StreamTelemetry,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

const fn default_active() -> bool {
    true
}

impl StreamRecord {
    /// Build the camera origin of a new lineage on `server_id`.
    #[must_use]
    pub fn origin(stream_id: String, user_id: &str, server_id: &str, draft: &RegisterDraft) -> Self {
        let now = Utc::now();
        Self {
            provenance_stream_id: stream_id.clone(),
            stream_id,
            user_id: user_id.to_string(),
            camera_id: draft.camera_id.clone(),
            source_server_id: server_id.to_string(),
            destination_server_id: server_id.to_string(),
            process_id: None,
            stream_name: draft.stream_name.clone(),
            stream_url: draft.stream_url.clone(),
            kind: StreamKind::Camera,
            stream_type: draft.stream_type,
            is_public: draft.is_public,
            is_active: true,
            is_publishing: false,
            is_stable: false,
            relay_state: HopState::Running,
            telemetry: StreamTelemetry::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Build an RTMP hop that republishes `upstream` from `source` to `destination`.
    ///
    /// The hop inherits ownership and provenance from `upstream`.
    #[must_use]
    pub fn relay_hop(
        stream_id: String,
        upstream: &Self,
        source_server_id: &str,
        destination_server_id: &str,
        stream_url: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            stream_id,
            provenance_stream_id: upstream.provenance_stream_id.clone(),
            user_id: upstream.user_id.clone(),
            camera_id: upstream.camera_id.clone(),
            source_server_id: source_server_id.to_string(),
            destination_server_id: destination_server_id.to_string(),
            process_id: None,
            stream_name: upstream.stream_name.clone(),
            stream_url,
            kind: StreamKind::Rtmp,
            stream_type: StreamType::Rtmp,
            is_public: upstream.is_public,
            is_active: true,
            is_publishing: false,
            is_stable: false,
            relay_state: HopState::Pending,
            telemetry: StreamTelemetry::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_origin(&self) -> bool {
        self.kind == StreamKind::Camera
    }

    /// Public-safe projection.
    #[must_use]
    pub fn view(&self) -> StreamView {
        StreamView {
            stream_id: self.stream_id.clone(),
            camera_id: self.camera_id.clone(),
            provenance_stream_id: self.provenance_stream_id.clone(),
            stream_name: self.stream_name.clone(),
            stream_type: self.stream_type,
            stream_url: self.stream_url.clone(),
            kind: self.kind,
            is_public: self.is_public,
        }
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            stream_id: self.stream_id.clone(),
            is_active: self.is_active,
            is_publishing: self.is_publishing,
            is_stable: self.is_stable,
            relay_state: self.relay_state,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Fields of a stream that may leave the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamView {
    pub stream_id: String,
    pub camera_id: String,
    pub provenance_stream_id: String,
    pub stream_name: String,
    pub stream_type: StreamType,
    pub stream_url: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub is_public: bool,
}

/// Point-in-time status of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub stream_id: String,
    pub is_active: bool,
    pub is_publishing: bool,
    pub is_stable: bool,
    pub relay_state: HopState,
    pub telemetry: StreamTelemetry,
}

/// Origin plus the local hop created for it during registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredLineage {
    pub origin: StreamRecord,
    pub hop: Option<StreamRecord>,
}
