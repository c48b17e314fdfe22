use mediarelay_cluster::RelayRequestData;
use mediarelay_core::{config::RtmpConfig, models::ServerRole};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{process::ProcessHandle, RelayError};

/// Advisory attached to playback answers while the stream is not yet live.
pub const NOT_PUBLISHING_ADVISORY: &str =
    "Stream will be available shortly, please check status API to know the status";

/// Identity and endpoints of the server the orchestrator runs on.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub server_id: String,
    pub role: ServerRole,
    pub rtmp: RtmpConfig,
}

impl OrchestratorSettings {
    #[must_use]
    pub fn new(server_id: impl Into<String>, role: ServerRole, rtmp: RtmpConfig) -> Self {
        Self {
            server_id: server_id.into(),
            role,
            rtmp,
        }
    }
}

/// Where the caller wants to play a stream from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackKind {
    /// Directly from this server.
    Local,
    /// Through this (cloud) server, relayed from the server owning the stream.
    Cloud,
}

impl FromStr for PlaybackKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            other => Err(RelayError::InvalidInput(format!(
                "Unknown playback kind: {other}"
            ))),
        }
    }
}

/// Caller-facing answer of a playback request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackAnswer {
    /// Playback URL with a `<TOKEN>` placeholder.
    pub url_template: String,
    pub is_publishing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PlaybackAnswer {
    #[must_use]
    pub fn new(url_template: String, is_publishing: bool) -> Self {
        Self {
            url_template,
            is_publishing,
            message: (!is_publishing).then(|| NOT_PUBLISHING_ADVISORY.to_string()),
        }
    }
}

/// Relay request to send to the server owning the upstream hop.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayDispatch {
    pub server_id: String,
    pub data: RelayRequestData,
}

/// Both outputs of a playback request. Dispatching `relay` is up to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackPlan {
    pub answer: PlaybackAnswer,
    pub relay: Option<RelayDispatch>,
}

/// A relay process that could not be probed or stopped during a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    pub stream_id: String,
    pub handle: ProcessHandle,
    pub reason: String,
}

/// Result of a cascading delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub rows_affected: u64,
    pub process_failures: Vec<ProcessFailure>,
}

impl DeleteOutcome {
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.rows_affected == 0
    }
}
