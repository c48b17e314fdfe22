//! Request/response over a fire-and-forget broker
//!
//! A caller publishes a [`TaskRequest`] and parks on a oneshot keyed by the
//! request's correlation id. The inbound path hands every [`TaskResponse`]
//! to [`CorrelationRegistry::deliver_response`], which resolves the matching
//! waiter at most once. Waiters are removed on every exit path: response,
//! timeout, publish failure, or the awaiting future being dropped.

use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{Broker, Error, Result, TaskIdentifier, TaskRequest, TaskResponse};

type Waiters = Arc<DashMap<String, oneshot::Sender<TaskResponse>>>;

pub struct CorrelationRegistry {
    broker: Arc<dyn Broker>,
    /// Topic responders publish responses to.
    reply_to: String,
    waiters: Waiters,
}

/// A registered waiter. Dropping it unregisters the correlation id.
pub struct PendingResponse {
    correlation_id: String,
    rx: oneshot::Receiver<TaskResponse>,
    waiters: Waiters,
}

impl PendingResponse {
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the response or fail with [`Error::Timeout`] after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<TaskResponse> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Broker(format!(
                "Waiter for {} was discarded",
                self.correlation_id
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "No response for {} within {}ms",
                self.correlation_id,
                timeout.as_millis()
            ))),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // only this waiter's own sender reports closed; a newer waiter under
        // the same id stays registered
        self.rx.close();
        self.waiters
            .remove_if(&self.correlation_id, |_, tx| tx.is_closed());
    }
}

impl CorrelationRegistry {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, reply_to: impl Into<String>) -> Self {
        Self {
            broker,
            reply_to: reply_to.into(),
            waiters: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Number of requests still awaiting a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Register a waiter for `correlation_id`.
    ///
    /// Fails with [`Error::DuplicateCorrelation`] while another waiter holds
    /// the same id.
    pub fn register(&self, correlation_id: &str) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        match self.waiters.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::DuplicateCorrelation(correlation_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        Ok(PendingResponse {
            correlation_id: correlation_id.to_string(),
            rx,
            waiters: Arc::clone(&self.waiters),
        })
    }

    /// Publish `task` to `topic` and wait for its response.
    pub async fn publish_and_await(
        &self,
        topic: &str,
        task: TaskIdentifier,
        data: Value,
        timeout: Duration,
    ) -> Result<TaskResponse> {
        let correlation_id = nanoid::nanoid!();
        // registered before publishing so a fast response cannot be missed
        let pending = self.register(&correlation_id)?;

        let request = TaskRequest {
            correlation_id: correlation_id.clone(),
            task_identifier: task,
            reply_to: Some(self.reply_to.clone()),
            data,
        };
        let payload = serde_json::to_string(&request)?;

        let message_id = self.broker.publish(topic, payload).await.map_err(|e| {
            warn!(
                correlation_id = %correlation_id,
                topic = %topic,
                task = %task,
                error = %e,
                "Failed to publish request"
            );
            e
        })?;

        debug!(
            correlation_id = %correlation_id,
            message_id = %message_id,
            topic = %topic,
            task = %task,
            "Request published, awaiting response"
        );

        let result = pending.wait(timeout).await;
        if let Err(Error::Timeout(_)) = &result {
            warn!(
                correlation_id = %correlation_id,
                topic = %topic,
                task = %task,
                timeout_ms = timeout.as_millis() as u64,
                "Request timed out"
            );
        }
        result
    }

    /// Resolve the waiter registered for `response.correlation_id`.
    ///
    /// Returns false for late or duplicate responses, which are dropped.
    pub fn deliver_response(&self, response: TaskResponse) -> bool {
        let Some((correlation_id, tx)) = self.waiters.remove(&response.correlation_id) else {
            debug!(
                correlation_id = %response.correlation_id,
                "No waiter for response, dropping"
            );
            return false;
        };

        if tx.send(response).is_err() {
            debug!(correlation_id = %correlation_id, "Waiter gone before response arrived");
            return false;
        }
        true
    }
}
