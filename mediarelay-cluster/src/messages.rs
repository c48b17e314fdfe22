//! Inter-server wire messages
//!
//! Requests and responses share the per-server `<serverId>.downstream`
//! topic. A request names the topic its response goes to in `replyTo`;
//! peers that omit it are answered on the responder's fallback topic.

use mediarelay_core::models::{RegisterDraft, StreamRecord};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskIdentifier {
    /// Register a camera stream on the receiving server.
    RegisterStream,
    /// Ask the receiving server to relay one of its hops to the requester.
    RequestRelay,
}

impl TaskIdentifier {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RegisterStream => "registerStream",
            Self::RequestRelay => "requestRelay",
        }
    }
}

impl std::fmt::Display for TaskIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub correlation_id: String,
    pub task_identifier: TaskIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub data: Value,
}

impl TaskRequest {
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtmp_stream_data: Option<Value>,
    /// Set when the remote server failed to handle the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResponse {
    #[must_use]
    pub fn success(
        correlation_id: impl Into<String>,
        stream_data: Option<Value>,
        rtmp_stream_data: Option<Value>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            stream_data,
            rtmp_stream_data,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Turn a remote error answer into [`Error::Remote`].
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(message) => Err(Error::Remote(message)),
            None => Ok(self),
        }
    }

    pub fn stream_data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.stream_data
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    pub fn rtmp_stream_data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.rtmp_stream_data
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }
}

/// Anything arriving on a downstream topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    // only requests require `taskIdentifier` and `data`, so they are tried first
    Request(TaskRequest),
    Response(TaskResponse),
}

impl InboundMessage {
    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// `data` of a `registerStream` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterStreamData {
    pub user_id: String,
    pub stream_data: RegisterDraft,
}

/// `data` of a `requestRelay` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequestData {
    /// Server the relay must publish to.
    pub cms_server_id: String,
    /// Whether the requester already holds a hop for this stream.
    pub is_existing_stream: bool,
    /// Upstream hop as known to the requester.
    pub stream_data: StreamRecord,
}
