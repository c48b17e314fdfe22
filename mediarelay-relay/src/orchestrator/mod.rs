//! Stream lineage orchestration
//!
//! Registers camera origins, fans each one out to a local RTMP relay hop,
//! answers playback requests, relays hops toward cloud servers on request
//! and tears whole lineages down together with their relay processes.

mod types;

#[cfg(test)]
mod tests;

pub use types::{
    DeleteOutcome, OrchestratorSettings, PlaybackAnswer, PlaybackKind, PlaybackPlan,
    ProcessFailure, RelayDispatch, NOT_PUBLISHING_ADVISORY,
};

use dashmap::DashMap;
use mediarelay_cluster::RelayRequestData;
use mediarelay_core::{
    models::{
        derive_stream_id, HopState, Page, PageParams, RegisterDraft, RegisteredLineage,
        StreamKind, StreamRecord, StreamStatus, StreamView,
    },
    repository::{CameraDirectory, StreamFilter, StreamStore},
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    process::{ProcessController, ProcessHandle},
    status::StatusProvider,
    RelayError, RelayResult,
};

pub struct StreamOrchestrator {
    settings: OrchestratorSettings,
    namespace: Uuid,
    store: Arc<dyn StreamStore>,
    cameras: Arc<dyn CameraDirectory>,
    processes: Arc<dyn ProcessController>,
    status: Arc<dyn StatusProvider>,
    /// Per-hop locks so concurrent relay requests start one process.
    relay_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StreamOrchestrator {
    #[must_use]
    pub fn new(
        settings: OrchestratorSettings,
        store: Arc<dyn StreamStore>,
        cameras: Arc<dyn CameraDirectory>,
        processes: Arc<dyn ProcessController>,
        status: Arc<dyn StatusProvider>,
    ) -> Self {
        let namespace = settings.role.stream_namespace();
        Self {
            settings,
            namespace,
            store,
            cameras,
            processes,
            status,
            relay_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.settings.server_id
    }

    /// Deterministic id of the origin registered for `draft` by `user_id`.
    #[must_use]
    pub fn origin_id(&self, user_id: &str, draft: &RegisterDraft) -> String {
        derive_stream_id(
            &self.namespace,
            &[user_id, &draft.camera_id, &draft.stream_name],
        )
    }

    /// Deterministic id of the local relay hop of `origin_id`.
    #[must_use]
    pub fn hop_id(&self, origin_id: &str) -> String {
        derive_stream_id(&self.namespace, &[origin_id, "relay", &self.settings.server_id])
    }

    /// Register camera streams and start their relay hops.
    ///
    /// The batch is all-or-nothing for origins: a duplicate (in the store or
    /// within the batch) fails with `Conflict`, an unknown camera with
    /// `NotFound`, and nothing is written in either case.
    pub async fn register(
        &self,
        user_id: &str,
        drafts: &[RegisterDraft],
    ) -> RelayResult<Vec<StreamView>> {
        let lineages = self.register_lineages(user_id, drafts).await?;
        Ok(lineages.iter().map(|l| l.origin.view()).collect())
    }

    /// Single-draft registration returning the full records.
    pub async fn register_lineage(
        &self,
        user_id: &str,
        draft: &RegisterDraft,
    ) -> RelayResult<RegisteredLineage> {
        let mut lineages = self
            .register_lineages(user_id, std::slice::from_ref(draft))
            .await?;
        lineages
            .pop()
            .ok_or_else(|| RelayError::OrchestrationFailed("Registration produced no lineage".to_string()))
    }

    pub async fn register_lineages(
        &self,
        user_id: &str,
        drafts: &[RegisterDraft],
    ) -> RelayResult<Vec<RegisteredLineage>> {
        if user_id.trim().is_empty() {
            return Err(RelayError::InvalidInput("userId must not be empty".to_string()));
        }
        if drafts.is_empty() {
            return Err(RelayError::InvalidInput("No streams to register".to_string()));
        }

        let mut seen = HashSet::with_capacity(drafts.len());
        for draft in drafts {
            draft.validate()?;
            if !seen.insert((draft.camera_id.as_str(), draft.stream_name.as_str())) {
                return Err(RelayError::Conflict(format!(
                    "Stream {} of camera {} appears twice in the batch",
                    draft.stream_name, draft.camera_id
                )));
            }
        }

        for draft in drafts {
            let key = StreamFilter::origin_key(user_id, &draft.camera_id, &draft.stream_name);
            if let Some(existing) = self.store.find_stream(&key).await? {
                debug!(
                    stream_id = %existing.stream_id,
                    camera_id = %draft.camera_id,
                    "Camera stream already registered"
                );
                return Err(RelayError::Conflict(format!(
                    "Stream {} of camera {} is already registered",
                    draft.stream_name, draft.camera_id
                )));
            }
            if self.cameras.find_camera(&draft.camera_id).await?.is_none() {
                return Err(RelayError::NotFound(format!("Camera {}", draft.camera_id)));
            }
        }

        let origins: Vec<StreamRecord> = drafts
            .iter()
            .map(|draft| {
                StreamRecord::origin(
                    self.origin_id(user_id, draft),
                    user_id,
                    &self.settings.server_id,
                    draft,
                )
            })
            .collect();

        self.store.register_streams(&origins).await.map_err(|e| {
            error!(user_id = %user_id, error = %e, "Failed to persist origins");
            RelayError::from(e)
        })?;

        let mut lineages = Vec::with_capacity(origins.len());
        for origin in origins {
            info!(
                stream_id = %origin.stream_id,
                camera_id = %origin.camera_id,
                server_id = %self.settings.server_id,
                "Origin stream registered"
            );
            let hop = match self.publish_relay_hop(&origin).await {
                Ok(hop) => Some(hop),
                Err(e) => {
                    error!(stream_id = %origin.stream_id, error = %e, "Failed to create relay hop");
                    None
                }
            };
            lineages.push(RegisteredLineage { origin, hop });
        }

        Ok(lineages)
    }

    /// Persist the local RTMP hop of `origin` and start its relay process.
    ///
    /// A process that fails to start leaves the hop `Failed` for the status
    /// poller to retry; only persistence errors are returned.
    pub async fn publish_relay_hop(&self, origin: &StreamRecord) -> RelayResult<StreamRecord> {
        let server_id = &self.settings.server_id;
        let hop_id = self.hop_id(&origin.stream_id);
        let hop_url = self.settings.rtmp.hop_url(&hop_id);

        let mut hop = StreamRecord::relay_hop(hop_id, origin, server_id, server_id, hop_url);
        self.store.register_streams(std::slice::from_ref(&hop)).await?;

        self.start_relay(&mut hop, &origin.stream_url).await?;
        Ok(hop)
    }

    /// Relay a local hop to the cloud server named in `request`.
    ///
    /// The hop toward the cloud reuses the upstream hop's `stream_id` with
    /// the cloud server as destination. A relay already running for that hop
    /// is reused.
    pub async fn publish_to_upstream(&self, request: &RelayRequestData) -> RelayResult<StreamRecord> {
        let server_id = &self.settings.server_id;
        let stream_id = &request.stream_data.stream_id;
        let target = &request.cms_server_id;

        let upstream = self
            .store
            .find_stream(&StreamFilter::new().stream_id(stream_id).destination(server_id))
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("Stream {stream_id} on {server_id}")))?;

        let key = format!("{stream_id}:{target}");
        let lock = Arc::clone(self.relay_locks.entry(key.clone()).or_default().value());
        let guard = lock.lock().await;

        let result = self.relay_to(&upstream, target, request.is_existing_stream).await;

        drop(guard);
        drop(lock);
        self.relay_locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);
        result
    }

    async fn relay_to(
        &self,
        upstream: &StreamRecord,
        target: &str,
        requester_has_hop: bool,
    ) -> RelayResult<StreamRecord> {
        let existing = self
            .store
            .find_stream(
                &StreamFilter::new()
                    .stream_id(&upstream.stream_id)
                    .destination(target),
            )
            .await?;

        if let Some(existing) = existing {
            if let Some(pid) = existing.process_id {
                if self.process_alive(&existing.stream_id, ProcessHandle::from_pid(pid)).await {
                    debug!(
                        stream_id = %existing.stream_id,
                        destination = %target,
                        pid = pid,
                        "Reusing running relay"
                    );
                    return Ok(existing);
                }
            }
        } else if requester_has_hop {
            debug!(
                stream_id = %upstream.stream_id,
                destination = %target,
                "Requester reports an existing hop unknown here, recreating it"
            );
        }

        let hop = StreamRecord::relay_hop(
            upstream.stream_id.clone(),
            upstream,
            &upstream.destination_server_id,
            target,
            self.settings.rtmp.cloud_ingest_url(&upstream.stream_id),
        );
        let mut hop = self.store.upsert_stream(&hop).await?;

        info!(
            stream_id = %hop.stream_id,
            source = %hop.source_server_id,
            destination = %target,
            "Relaying stream upstream"
        );
        self.start_relay(&mut hop, &upstream.stream_url).await?;
        Ok(hop)
    }

    async fn process_alive(&self, stream_id: &str, handle: ProcessHandle) -> bool {
        match self.processes.is_running(handle).await {
            Ok(running) => running,
            Err(e) => {
                warn!(stream_id = %stream_id, pid = handle.pid(), error = %e, "Relay probe failed");
                false
            }
        }
    }

    /// Start the relay process of `hop` and record the outcome on the hop.
    async fn start_relay(&self, hop: &mut StreamRecord, input_url: &str) -> RelayResult<()> {
        let (process_id, state) = match self.processes.start(input_url, &hop.stream_url).await {
            Ok(handle) => (Some(handle.pid()), HopState::Running),
            Err(e) => {
                warn!(
                    stream_id = %hop.stream_id,
                    destination = %hop.destination_server_id,
                    error = %e,
                    "Relay process failed to start, leaving hop for retry"
                );
                (None, HopState::Failed)
            }
        };

        let recorded = self
            .store
            .set_relay_process(&hop.stream_id, &hop.destination_server_id, process_id, state)
            .await;

        let failure = match recorded {
            Ok(true) => None,
            Ok(false) => {
                warn!(
                    stream_id = %hop.stream_id,
                    destination = %hop.destination_server_id,
                    "Hop removed while its relay was starting"
                );
                Some(RelayError::NotFound(format!(
                    "Stream {} on {}",
                    hop.stream_id, hop.destination_server_id
                )))
            }
            Err(e) => {
                error!(stream_id = %hop.stream_id, error = %e, "Failed to record relay process");
                Some(e.into())
            }
        };

        if let Some(err) = failure {
            // an unrecorded process could never be stopped through the lineage
            if let Some(pid) = process_id {
                if let Err(kill_err) = self.processes.kill(ProcessHandle::from_pid(pid)).await {
                    warn!(pid = pid, error = %kill_err, "Failed to stop unrecorded relay");
                }
            }
            return Err(err);
        }

        hop.process_id = process_id;
        hop.relay_state = state;
        if state == HopState::Failed {
            hop.is_publishing = false;
        }
        Ok(())
    }

    /// Resolve a playback request for `stream_id`.
    ///
    /// `Cloud` requests always carry the relay request for the server owning
    /// the upstream hop; the caller decides whether to send it.
    pub async fn stream_request(
        &self,
        stream_id: &str,
        kind: PlaybackKind,
    ) -> RelayResult<PlaybackPlan> {
        match kind {
            PlaybackKind::Local => {
                let stream = self
                    .store
                    .find_stream(&StreamFilter::new().stream_id(stream_id))
                    .await?
                    .ok_or_else(|| RelayError::NotFound(format!("Stream {stream_id}")))?;

                Ok(PlaybackPlan {
                    answer: PlaybackAnswer::new(
                        self.settings.rtmp.local_playback_url(stream_id),
                        stream.is_publishing,
                    ),
                    relay: None,
                })
            }
            PlaybackKind::Cloud => {
                let server_id = &self.settings.server_id;
                let pulled = self
                    .store
                    .find_stream(&StreamFilter::new().stream_id(stream_id).destination(server_id))
                    .await?;
                let is_existing_stream = pulled.is_some();

                let upstream = match pulled {
                    Some(pulled) => {
                        self.store
                            .find_stream(
                                &StreamFilter::new()
                                    .stream_id(stream_id)
                                    .destination(&pulled.source_server_id),
                            )
                            .await?
                    }
                    None => None,
                };
                let upstream = match upstream {
                    Some(upstream) => upstream,
                    None => self
                        .store
                        .find_stream(&StreamFilter::new().stream_id(stream_id))
                        .await?
                        .ok_or_else(|| RelayError::NotFound(format!("Stream {stream_id}")))?,
                };

                let answer = PlaybackAnswer::new(
                    self.settings.rtmp.public_playback_url(stream_id),
                    upstream.is_publishing,
                );
                let relay = RelayDispatch {
                    server_id: upstream.source_server_id.clone(),
                    data: RelayRequestData {
                        cms_server_id: server_id.clone(),
                        is_existing_stream,
                        stream_data: upstream,
                    },
                };

                Ok(PlaybackPlan {
                    answer,
                    relay: Some(relay),
                })
            }
        }
    }

    /// Delete the lineage rooted at origin `stream_id`.
    ///
    /// Every hop's relay is probed and stopped before its record goes. Probe
    /// or kill failures are collected in the outcome and never stop the
    /// remaining deletions. An unknown origin yields `rows_affected == 0`.
    pub async fn delete(&self, stream_id: &str) -> RelayResult<DeleteOutcome> {
        let origin = self
            .store
            .find_stream(&StreamFilter::new().stream_id(stream_id).kind(StreamKind::Camera))
            .await?;

        let Some(origin) = origin else {
            debug!(stream_id = %stream_id, "Delete of unknown origin");
            return Ok(DeleteOutcome::default());
        };

        let lineage = self.store.associated_streams(&origin.provenance_stream_id).await?;
        let mut outcome = DeleteOutcome::default();

        // hops first, origin last
        for record in lineage.iter().rev() {
            if let Some(pid) = record.process_id {
                let handle = ProcessHandle::from_pid(pid);
                if let Err(reason) = self.stop_relay(handle).await {
                    warn!(
                        stream_id = %record.stream_id,
                        pid = pid,
                        error = %reason,
                        "Could not stop relay, deleting record anyway"
                    );
                    outcome.process_failures.push(ProcessFailure {
                        stream_id: record.stream_id.clone(),
                        handle,
                        reason: reason.to_string(),
                    });
                }

                if let Err(e) = self
                    .store
                    .set_relay_process(
                        &record.stream_id,
                        &record.destination_server_id,
                        None,
                        HopState::Stopped,
                    )
                    .await
                {
                    warn!(stream_id = %record.stream_id, error = %e, "Failed to mark hop stopped");
                }
            }

            let deleted = self
                .store
                .delete_streams(
                    &StreamFilter::new()
                        .stream_id(&record.stream_id)
                        .destination(&record.destination_server_id),
                )
                .await
                .map_err(|e| {
                    error!(stream_id = %record.stream_id, error = %e, "Failed to delete stream record");
                    RelayError::from(e)
                })?;
            outcome.rows_affected += deleted;
        }

        info!(
            stream_id = %stream_id,
            rows_affected = outcome.rows_affected,
            process_failures = outcome.process_failures.len(),
            "Lineage deleted"
        );
        Ok(outcome)
    }

    async fn stop_relay(&self, handle: ProcessHandle) -> RelayResult<()> {
        if self.processes.is_running(handle).await? {
            self.processes.kill(handle).await?;
        }
        Ok(())
    }

    pub async fn find_one(&self, stream_id: &str) -> RelayResult<Option<StreamView>> {
        let record = self
            .store
            .find_stream(&StreamFilter::new().stream_id(stream_id))
            .await?;
        Ok(record.map(|r| r.view()))
    }

    pub async fn find_all(&self, params: PageParams) -> RelayResult<Page<StreamView>> {
        let records = self
            .store
            .list_streams(params.limit(), params.offset())
            .await?;
        let total = self.store.count_streams().await?;

        Ok(Page::new(records, total, params).map(|r| r.view()))
    }

    pub async fn get_status(&self, stream_id: &str) -> RelayResult<StreamStatus> {
        self.status
            .get_status(stream_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("Status of stream {stream_id}")))
    }
}
