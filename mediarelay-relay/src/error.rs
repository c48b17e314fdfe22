use thiserror::Error;

/// Failure kinds surfaced by stream orchestration.
#[derive(Debug, Error)]
pub enum RelayError {
    /// An origin with the same camera stream is already registered.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A cross-server request got no answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Relay process failed to start: {0}")]
    ProcessStartFailed(String),

    #[error("Duplicate correlation id: {0}")]
    DuplicateCorrelation(String),

    #[error("Store failure: {0}")]
    StoreFailure(String),

    #[error("Orchestration failed: {0}")]
    OrchestrationFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl RelayError {
    /// Outcomes callers report as "no content" rather than as failures.
    #[must_use]
    pub const fn is_no_content(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::NotFound(_))
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Rebuild an error from the message a remote server answered with.
    #[must_use]
    pub fn from_remote(message: &str) -> Self {
        let kinds: [(&str, fn(String) -> Self); 4] = [
            ("Conflict: ", Self::Conflict),
            ("Not found: ", Self::NotFound),
            ("Invalid input: ", Self::InvalidInput),
            ("Relay process failed to start: ", Self::ProcessStartFailed),
        ];
        for (prefix, kind) in kinds {
            if let Some(detail) = message.strip_prefix(prefix) {
                return kind(format!("remote: {detail}"));
            }
        }
        Self::OrchestrationFailed(format!("remote: {message}"))
    }
}

impl From<mediarelay_core::Error> for RelayError {
    fn from(err: mediarelay_core::Error) -> Self {
        use mediarelay_core::Error as Core;
        match err {
            Core::AlreadyExists(msg) => Self::Conflict(msg),
            Core::NotFound(msg) => Self::NotFound(msg),
            Core::InvalidInput(msg) => Self::InvalidInput(msg),
            Core::Database(e) => Self::StoreFailure(e.to_string()),
            Core::Serialization(e) => Self::OrchestrationFailed(e.to_string()),
            Core::Internal(msg) => Self::OrchestrationFailed(msg),
        }
    }
}

impl From<mediarelay_cluster::Error> for RelayError {
    fn from(err: mediarelay_cluster::Error) -> Self {
        use mediarelay_cluster::Error as Cluster;
        match err {
            Cluster::Timeout(msg) => Self::Timeout(msg),
            Cluster::DuplicateCorrelation(id) => Self::DuplicateCorrelation(id),
            Cluster::Remote(msg) => Self::from_remote(&msg),
            other => Self::OrchestrationFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::OrchestrationFailed(format!("Malformed payload: {err}"))
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
