use async_trait::async_trait;
use mediarelay_core::{
    models::StreamStatus,
    repository::{StreamFilter, StreamStore},
};
use std::sync::Arc;

use crate::RelayResult;

/// Read-only view of stream telemetry owned by the status subsystem.
#[async_trait]
pub trait StatusProvider: Send + Sync {
    async fn get_status(&self, stream_id: &str) -> RelayResult<Option<StreamStatus>>;
}

/// Reads the telemetry columns the status poller writes to the lineage store.
pub struct StoreStatusProvider {
    store: Arc<dyn StreamStore>,
}

impl StoreStatusProvider {
    #[must_use]
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatusProvider for StoreStatusProvider {
    async fn get_status(&self, stream_id: &str) -> RelayResult<Option<StreamStatus>> {
        let record = self
            .store
            .find_stream(&StreamFilter::new().stream_id(stream_id))
            .await?;
        Ok(record.map(|r| r.status()))
    }
}
