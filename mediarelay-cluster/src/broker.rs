use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Message delivered to a topic subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub message_id: String,
    pub payload: String,
}

/// Fire-and-forget publish/subscribe transport.
///
/// No delivery or ordering guarantee is assumed beyond best effort. A
/// subscription ends when the returned receiver is dropped or the broker
/// shuts down.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` to `topic`, returning the broker assigned message id.
    async fn publish(&self, topic: &str, payload: String) -> Result<String>;

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>>;
}
