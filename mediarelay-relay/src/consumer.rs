//! Inbound side of cross-server messaging
//!
//! Consumes the server's downstream topic. Responses resolve waiting
//! callers; requests are handled on their own task and answered on the
//! requester's reply topic.

use mediarelay_cluster::{
    Broker, BrokerMessage, CorrelationRegistry, InboundMessage, RegisterStreamData,
    RelayRequestData, RequestDeduplicator, TaskIdentifier, TaskRequest, TaskResponse,
};
use mediarelay_core::models::downstream_topic;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{orchestrator::StreamOrchestrator, RelayResult};

pub struct DownstreamConsumer {
    server_id: String,
    broker: Arc<dyn Broker>,
    registry: Arc<CorrelationRegistry>,
    orchestrator: Arc<StreamOrchestrator>,
    dedup: RequestDeduplicator,
    /// Answers requests that carry no `replyTo`.
    fallback_reply_topic: Option<String>,
    cancel: CancellationToken,
}

impl DownstreamConsumer {
    #[must_use]
    pub fn new(
        server_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        registry: Arc<CorrelationRegistry>,
        orchestrator: Arc<StreamOrchestrator>,
        dedup: RequestDeduplicator,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            broker,
            registry,
            orchestrator,
            dedup,
            fallback_reply_topic: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Answer requests without `replyTo` on `topic`. Empty disables it.
    #[must_use]
    pub fn with_fallback_reply_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        self.fallback_reply_topic = (!topic.is_empty()).then_some(topic);
        self
    }

    /// Subscribe to this server's topic and start consuming.
    ///
    /// The returned handle finishes after [`shutdown`](Self::shutdown) or
    /// when the subscription closes.
    pub async fn start(self: Arc<Self>, cleanup_interval: Duration) -> RelayResult<JoinHandle<()>> {
        let topic = downstream_topic(&self.server_id);
        let rx = self.broker.subscribe(&topic).await?;
        let cleanup = self.dedup.spawn_cleanup(cleanup_interval, self.cancel.clone());

        info!(server_id = %self.server_id, topic = %topic, "Consuming downstream topic");

        let handle = tokio::spawn(async move {
            self.run(rx).await;
            self.cancel.cancel();
            let _ = cleanup.await;
        });
        Ok(handle)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn run(self: &Arc<Self>, mut rx: mpsc::Receiver<BrokerMessage>) {
        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(server_id = %self.server_id, "Downstream consumer shutting down");
                    return;
                }
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                warn!(server_id = %self.server_id, "Downstream subscription closed");
                return;
            };

            match InboundMessage::decode(&message.payload) {
                Ok(InboundMessage::Response(response)) => {
                    self.registry.deliver_response(response);
                }
                Ok(InboundMessage::Request(request)) => {
                    if !self.dedup.should_process(&request.correlation_id) {
                        debug!(
                            correlation_id = %request.correlation_id,
                            message_id = %message.message_id,
                            "Skipping redelivered request"
                        );
                        continue;
                    }
                    let consumer = Arc::clone(self);
                    tokio::spawn(async move {
                        consumer.handle_request(request).await;
                    });
                }
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Dropping undecodable message"
                    );
                }
            }
        }
    }

    async fn handle_request(&self, request: TaskRequest) {
        let reply_to = request
            .reply_to
            .as_deref()
            .or(self.fallback_reply_topic.as_deref());
        debug!(
            correlation_id = %request.correlation_id,
            task = %request.task_identifier,
            reply_to = ?reply_to,
            "Handling request"
        );

        let response = match self.dispatch(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    correlation_id = %request.correlation_id,
                    task = %request.task_identifier,
                    error = %e,
                    "Request failed"
                );
                TaskResponse::failure(&request.correlation_id, e.to_string())
            }
        };

        let Some(reply_to) = reply_to else {
            warn!(
                correlation_id = %request.correlation_id,
                task = %request.task_identifier,
                "Request names no reply topic, dropping answer"
            );
            return;
        };
        let payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(correlation_id = %request.correlation_id, error = %e, "Failed to encode response");
                return;
            }
        };
        if let Err(e) = self.broker.publish(reply_to, payload).await {
            error!(
                correlation_id = %request.correlation_id,
                reply_to = %reply_to,
                error = %e,
                "Failed to publish response"
            );
        }
    }

    async fn dispatch(&self, request: &TaskRequest) -> RelayResult<TaskResponse> {
        match request.task_identifier {
            TaskIdentifier::RegisterStream => {
                let data: RegisterStreamData = request.data_as()?;
                let lineage = self
                    .orchestrator
                    .register_lineage(&data.user_id, &data.stream_data)
                    .await?;
                let hop = lineage.hop.as_ref().map(serde_json::to_value).transpose()?;
                Ok(TaskResponse::success(
                    &request.correlation_id,
                    Some(serde_json::to_value(&lineage.origin)?),
                    hop,
                ))
            }
            TaskIdentifier::RequestRelay => {
                let data: RelayRequestData = request.data_as()?;
                let hop = self.orchestrator.publish_to_upstream(&data).await?;
                Ok(TaskResponse::success(
                    &request.correlation_id,
                    Some(serde_json::to_value(&hop)?),
                    None,
                ))
            }
        }
    }
}
