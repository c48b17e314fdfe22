//! Cross-server messaging for mediarelay
//!
//! - [`Broker`]: publish/subscribe transport, backed by Redis or in-process
//! - [`CorrelationRegistry`]: request/response on top of a broker
//! - [`messages`]: the JSON wire format
//! - [`RequestDeduplicator`]: suppresses redelivered requests

pub mod broker;
pub mod correlation;
pub mod dedup;
pub mod error;
pub mod memory_broker;
pub mod messages;
pub mod redis_broker;

pub use broker::{Broker, BrokerMessage};
pub use correlation::{CorrelationRegistry, PendingResponse};
pub use dedup::RequestDeduplicator;
pub use error::{Error, Result};
pub use memory_broker::MemoryBroker;
pub use messages::{
    InboundMessage, RegisterStreamData, RelayRequestData, TaskIdentifier, TaskRequest,
    TaskResponse,
};
pub use redis_broker::RedisBroker;
