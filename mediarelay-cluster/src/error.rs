//! Error types for cluster messaging

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// A waiter is already registered for this correlation id.
    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelation(String),

    /// The remote server answered with an error.
    #[error("Remote error: {0}")]
    Remote(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Broker(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
