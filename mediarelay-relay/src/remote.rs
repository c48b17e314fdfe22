//! Cross-server calls made by the cloud server
//!
//! Registration and relay requests are sent to the server that owns the
//! camera or hop. Successful answers are mirrored into the local store
//! without a process id: the relay process runs on the remote server.

use mediarelay_cluster::{CorrelationRegistry, RegisterStreamData, TaskIdentifier};
use mediarelay_core::{
    models::{downstream_topic, RegisterDraft, RegisteredLineage, StreamRecord},
    repository::StreamStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    orchestrator::{PlaybackAnswer, PlaybackKind, RelayDispatch, StreamOrchestrator},
    RelayError, RelayResult,
};

pub struct RemoteStreams {
    orchestrator: Arc<StreamOrchestrator>,
    registry: Arc<CorrelationRegistry>,
    store: Arc<dyn StreamStore>,
    timeout: Duration,
}

impl RemoteStreams {
    #[must_use]
    pub fn new(
        orchestrator: Arc<StreamOrchestrator>,
        registry: Arc<CorrelationRegistry>,
        store: Arc<dyn StreamStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            store,
            timeout,
        }
    }

    /// Register a camera stream on `server_id` and mirror the answer.
    pub async fn register_remote(
        &self,
        server_id: &str,
        user_id: &str,
        draft: &RegisterDraft,
    ) -> RelayResult<RegisteredLineage> {
        draft.validate()?;

        let data = serde_json::to_value(RegisterStreamData {
            user_id: user_id.to_string(),
            stream_data: draft.clone(),
        })?;
        let response = self
            .registry
            .publish_and_await(
                &downstream_topic(server_id),
                TaskIdentifier::RegisterStream,
                data,
                self.timeout,
            )
            .await?
            .into_result()?;

        let mut origin: StreamRecord = response.stream_data_as()?.ok_or_else(|| {
            RelayError::OrchestrationFailed(format!(
                "{server_id} answered registerStream without streamData"
            ))
        })?;
        let mut hop: Option<StreamRecord> = response.rtmp_stream_data_as()?;

        origin.process_id = None;
        let mut mirrored = vec![origin.clone()];
        if let Some(hop) = hop.as_mut() {
            hop.process_id = None;
            mirrored.push(hop.clone());
        }
        self.store.register_streams(&mirrored).await?;

        info!(
            stream_id = %origin.stream_id,
            server_id = %server_id,
            with_hop = hop.is_some(),
            "Remote stream registered"
        );
        Ok(RegisteredLineage { origin, hop })
    }

    /// Answer a playback request, asking the owning server to relay when the
    /// stream is not live here yet.
    ///
    /// A relay request that times out does not fail playback; the answer
    /// still tells the caller to poll status.
    pub async fn request_playback(
        &self,
        stream_id: &str,
        kind: PlaybackKind,
    ) -> RelayResult<PlaybackAnswer> {
        let plan = self.orchestrator.stream_request(stream_id, kind).await?;

        let Some(relay) = plan.relay else {
            return Ok(plan.answer);
        };
        if plan.answer.is_publishing {
            return Ok(plan.answer);
        }

        match self.dispatch_relay(&relay).await {
            Ok(mut hop) => {
                hop.process_id = None;
                self.store.upsert_stream(&hop).await?;
            }
            Err(e) if e.is_timeout() => {
                warn!(
                    stream_id = %stream_id,
                    server_id = %relay.server_id,
                    error = %e,
                    "Relay request timed out, answering without it"
                );
            }
            Err(e) => return Err(e),
        }

        Ok(plan.answer)
    }

    /// Send `relay` to its server and return the hop it created or reused.
    pub async fn dispatch_relay(&self, relay: &RelayDispatch) -> RelayResult<StreamRecord> {
        let data = serde_json::to_value(&relay.data)?;
        let response = self
            .registry
            .publish_and_await(
                &downstream_topic(&relay.server_id),
                TaskIdentifier::RequestRelay,
                data,
                self.timeout,
            )
            .await?
            .into_result()?;

        response.stream_data_as()?.ok_or_else(|| {
            RelayError::OrchestrationFailed(format!(
                "{} answered requestRelay without streamData",
                relay.server_id
            ))
        })
    }
}
