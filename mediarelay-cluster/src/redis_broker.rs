use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client as RedisClient};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OnceCell};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Broker, BrokerMessage, Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

const SUBSCRIBER_CAPACITY: usize = 1024;

/// Redis Pub/Sub broker.
///
/// Each topic maps to the Redis channel of the same name. Publishing goes
/// through a shared auto-reconnecting connection; every subscription owns a
/// Pub/Sub connection and a task that resubscribes with exponential backoff
/// when Redis drops it. Messages published while a subscriber is
/// reconnecting are lost.
pub struct RedisBroker {
    client: RedisClient,
    publisher: OnceCell<ConnectionManager>,
    cancel_token: CancellationToken,
}

/// Wire envelope carrying the message id alongside the payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    message_id: String,
    payload: String,
}

enum SubscriberExit {
    /// Receiver dropped or broker shut down.
    Closed,
    /// Connection was healthy, then the message stream ended.
    Disconnected,
    ConnectFailed(Error),
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        Ok(Self {
            client,
            publisher: OnceCell::new(),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Stop every subscriber task.
    pub fn shutdown(&self) {
        info!("Shutting down Redis broker");
        self.cancel_token.cancel();
    }

    async fn publisher(&self) -> Result<ConnectionManager> {
        let conn = self
            .publisher
            .get_or_try_init(|| async {
                timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                .map_err(|_| Error::Broker("Timed out connecting to Redis".to_string()))?
                .map_err(Error::from)
            })
            .await?;
        Ok(conn.clone())
    }

    async fn connect_pubsub(client: &RedisClient, topic: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            client.get_async_pubsub(),
        )
        .await
        .map_err(|_| Error::Broker("Timed out getting Redis Pub/Sub connection".to_string()))??;

        timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), pubsub.subscribe(topic))
            .await
            .map_err(|_| Error::Broker(format!("Timed out subscribing to {topic}")))??;

        Ok(pubsub)
    }

    fn decode(topic: &str, raw: String) -> BrokerMessage {
        match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => BrokerMessage {
                topic: topic.to_string(),
                message_id: envelope.message_id,
                payload: envelope.payload,
            },
            // published by something other than a RedisBroker
            Err(_) => BrokerMessage {
                topic: topic.to_string(),
                message_id: nanoid::nanoid!(),
                payload: raw,
            },
        }
    }

    async fn forward(
        mut pubsub: redis::aio::PubSub,
        topic: &str,
        tx: &mpsc::Sender<BrokerMessage>,
        cancel: &CancellationToken,
    ) -> SubscriberExit {
        let mut stream = pubsub.on_message();

        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => return SubscriberExit::Closed,
                () = tx.closed() => return SubscriberExit::Closed,
                msg = stream.next() => msg,
            };

            let Some(msg) = msg else {
                return SubscriberExit::Disconnected;
            };

            let raw: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, topic = %topic, "Invalid payload");
                    continue;
                }
            };

            if tx.send(Self::decode(topic, raw)).await.is_err() {
                return SubscriberExit::Closed;
            }
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<String> {
        let message_id = nanoid::nanoid!();
        let body = serde_json::to_string(&Envelope {
            message_id: message_id.clone(),
            payload,
        })?;

        let mut conn = self.publisher().await?;
        let subscribers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish::<_, _, usize>(topic, body),
        )
        .await
        .map_err(|_| Error::Broker(format!("Timed out publishing to {topic}")))??;

        debug!(
            topic = %topic,
            message_id = %message_id,
            subscribers = subscribers,
            "Message published to Redis"
        );
        Ok(message_id)
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BrokerMessage>> {
        // first connection is made inline so callers see configuration errors
        let initial = Self::connect_pubsub(&self.client, topic).await?;
        info!(topic = %topic, "Redis subscriber connected");

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let client = self.client.clone();
        let topic = topic.to_string();
        let cancel = self.cancel_token.child_token();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;
            let mut next = Some(initial);

            loop {
                let pubsub = match next.take() {
                    Some(pubsub) => Ok(pubsub),
                    None => Self::connect_pubsub(&client, &topic).await,
                };

                let exit = match pubsub {
                    Ok(pubsub) => Self::forward(pubsub, &topic, &tx, &cancel).await,
                    Err(e) => SubscriberExit::ConnectFailed(e),
                };

                match exit {
                    SubscriberExit::Closed => {
                        debug!(topic = %topic, "Redis subscriber closed");
                        return;
                    }
                    SubscriberExit::Disconnected => {
                        error!(
                            topic = %topic,
                            "Redis subscriber stream ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            topic = %topic,
                            backoff_secs = backoff_secs,
                            "Redis subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!(topic = %topic, "Redis subscriber cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }

                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        Ok(rx)
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
