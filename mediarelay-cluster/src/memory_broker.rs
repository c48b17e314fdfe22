use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Broker, BrokerMessage, Result};

/// Buffered messages per subscriber before publishes start dropping.
const SUBSCRIBER_CAPACITY: usize = 1024;

/// In-process broker for single-node mode and tests.
///
/// Every subscriber of a topic receives every message published after it
/// subscribed. Messages to a topic without subscribers are dropped.
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<String, Vec<mpsc::Sender<BrokerMessage>>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriber count for `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<String> {
        let message_id = nanoid::nanoid!();

        // snapshot senders so no map guard is held while delivering
        let subscribers = match self.topics.get_mut(topic) {
            Some(mut subs) => {
                subs.retain(|tx| !tx.is_closed());
                subs.clone()
            }
            None => Vec::new(),
        };

        if subscribers.is_empty() {
            debug!(topic = %topic, message_id = %message_id, "No subscribers, message dropped");
            return Ok(message_id);
        }

        let message = BrokerMessage {
            topic: topic.to_string(),
            message_id: message_id.clone(),
            payload,
        };
        for tx in subscribers {
            if let Err(e) = tx.try_send(message.clone()) {
                warn!(topic = %topic, message_id = %message_id, error = %e, "Subscriber lagging, message dropped");
            }
        }

        Ok(message_id)
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.topics.entry(topic.to_string()).or_default().push(tx);
        debug!(topic = %topic, "Subscribed to in-process topic");
        Ok(rx)
    }
}
