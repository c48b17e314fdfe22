//! In-process stores for single-node runs and tests.
//!
//! They enforce the same keys as the `PostgreSQL` schema: one record per
//! `(stream_id, destination_server_id)` and one origin per
//! `(user_id, camera_id, stream_name)`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{CameraDirectory, StreamFilter, StreamStore};
use crate::{
    models::{Camera, HopState, StreamRecord},
    Error, Result,
};

#[derive(Default)]
pub struct MemoryStreamStore {
    // insertion order doubles as creation order
    records: RwLock<Vec<StreamRecord>>,
}

impl MemoryStreamStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn conflict(existing: &[StreamRecord], record: &StreamRecord) -> Option<Error> {
        for other in existing {
            if other.stream_id == record.stream_id
                && other.destination_server_id == record.destination_server_id
            {
                return Some(Error::AlreadyExists("Stream record already exists".to_string()));
            }
            if record.is_origin()
                && other.is_origin()
                && other.user_id == record.user_id
                && other.camera_id == record.camera_id
                && other.stream_name == record.stream_name
            {
                return Some(Error::AlreadyExists("Camera stream already registered".to_string()));
            }
        }
        None
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn find_stream(&self, filter: &StreamFilter) -> Result<Option<StreamRecord>> {
        Ok(self.records.read().iter().find(|r| filter.matches(r)).cloned())
    }

    async fn list_streams(&self, limit: i64, offset: i64) -> Result<Vec<StreamRecord>> {
        let skip = usize::try_from(offset).unwrap_or_default();
        let take = usize::try_from(limit).unwrap_or_default();
        Ok(self.records.read().iter().skip(skip).take(take).cloned().collect())
    }

    async fn count_streams(&self) -> Result<u64> {
        Ok(self.records.read().len() as u64)
    }

    async fn register_streams(&self, records: &[StreamRecord]) -> Result<()> {
        let mut guard = self.records.write();

        // validate the whole batch before touching the table
        let mut staged: Vec<StreamRecord> = Vec::with_capacity(records.len());
        for record in records {
            if let Some(err) =
                Self::conflict(&guard, record).or_else(|| Self::conflict(&staged, record))
            {
                return Err(err);
            }
            staged.push(record.clone());
        }

        guard.extend(staged);
        Ok(())
    }

    async fn upsert_stream(&self, record: &StreamRecord) -> Result<StreamRecord> {
        let mut guard = self.records.write();

        if let Some(existing) = guard.iter_mut().find(|r| {
            r.stream_id == record.stream_id
                && r.destination_server_id == record.destination_server_id
        }) {
            existing.provenance_stream_id.clone_from(&record.provenance_stream_id);
            existing.user_id.clone_from(&record.user_id);
            existing.camera_id.clone_from(&record.camera_id);
            existing.source_server_id.clone_from(&record.source_server_id);
            existing.stream_name.clone_from(&record.stream_name);
            existing.stream_url.clone_from(&record.stream_url);
            existing.stream_type = record.stream_type;
            existing.is_public = record.is_public;
            existing.is_active = true;
            existing.updated_at = record.updated_at;
            return Ok(existing.clone());
        }

        if let Some(err) = Self::conflict(&guard, record) {
            return Err(err);
        }
        guard.push(record.clone());
        Ok(record.clone())
    }

    async fn set_relay_process(
        &self,
        stream_id: &str,
        destination_server_id: &str,
        process_id: Option<u32>,
        state: HopState,
    ) -> Result<bool> {
        let mut guard = self.records.write();
        let Some(record) = guard.iter_mut().find(|r| {
            r.stream_id == stream_id && r.destination_server_id == destination_server_id
        }) else {
            return Ok(false);
        };

        record.process_id = process_id;
        record.relay_state = state;
        if matches!(state, HopState::Failed | HopState::Stopped) {
            record.is_publishing = false;
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_streams(&self, filter: &StreamFilter) -> Result<u64> {
        if filter.is_empty() {
            return Err(Error::InvalidInput(
                "Refusing to delete streams without a filter".to_string(),
            ));
        }

        let mut guard = self.records.write();
        let before = guard.len();
        guard.retain(|r| !filter.matches(r));
        Ok((before - guard.len()) as u64)
    }

    async fn associated_streams(&self, provenance_stream_id: &str) -> Result<Vec<StreamRecord>> {
        let guard = self.records.read();
        let mut lineage: Vec<StreamRecord> = guard
            .iter()
            .filter(|r| r.provenance_stream_id == provenance_stream_id)
            .cloned()
            .collect();
        // stable sort keeps creation order among hops
        lineage.sort_by_key(|r| !r.is_origin());
        Ok(lineage)
    }
}

#[derive(Default)]
pub struct MemoryCameraDirectory {
    cameras: RwLock<HashMap<String, Camera>>,
}

impl MemoryCameraDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, camera: Camera) {
        self.cameras.write().insert(camera.camera_id.clone(), camera);
    }
}

#[async_trait]
impl CameraDirectory for MemoryCameraDirectory {
    async fn find_camera(&self, camera_id: &str) -> Result<Option<Camera>> {
        Ok(self.cameras.read().get(camera_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RegisterDraft, StreamKind, StreamType};

    fn draft(name: &str) -> RegisterDraft {
        RegisterDraft {
            camera_id: "c1".to_string(),
            stream_name: name.to_string(),
            stream_url: "rtsp://10.0.0.5/1".to_string(),
            is_public: true,
            stream_type: StreamType::Rtsp,
        }
    }

    fn origin(id: &str, name: &str) -> StreamRecord {
        StreamRecord::origin(id.to_string(), "u1", "lms-1", &draft(name))
    }

    fn hop(id: &str, upstream: &StreamRecord, destination: &str) -> StreamRecord {
        StreamRecord::relay_hop(
            id.to_string(),
            upstream,
            &upstream.destination_server_id,
            destination,
            format!("rtmp://localhost/live/{id}"),
        )
    }

    #[tokio::test]
    async fn test_register_batch_is_atomic() {
        let store = MemoryStreamStore::new();
        store.register_streams(&[origin("s1", "front")]).await.unwrap();

        // second record collides on the origin key, so nothing is written
        let err = store
            .register_streams(&[origin("s2", "back"), origin("s3", "front")])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_in_batch_duplicates_conflict() {
        let store = MemoryStreamStore::new();
        let result = store
            .register_streams(&[origin("s1", "front"), origin("s2", "front")])
            .await;

        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_same_stream_id_different_destination() {
        let store = MemoryStreamStore::new();
        let o = origin("s1", "front");
        let h = hop("h1", &o, "lms-1");
        let cloud = hop("h1", &h, "cms-1");

        store.register_streams(&[o, h, cloud]).await.unwrap();

        let found = store
            .find_stream(&StreamFilter::new().stream_id("h1").destination("cms-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.source_server_id, "lms-1");

        // unqualified lookups return the earliest record
        let first = store
            .find_stream(&StreamFilter::new().stream_id("h1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.destination_server_id, "lms-1");
    }

    #[tokio::test]
    async fn test_upsert_keeps_process_state() {
        let store = MemoryStreamStore::new();
        let o = origin("s1", "front");
        let h = hop("h1", &o, "cms-1");
        store.register_streams(&[o, h.clone()]).await.unwrap();
        store
            .set_relay_process("h1", "cms-1", Some(42), HopState::Running)
            .await
            .unwrap();

        let mut changed = h;
        changed.stream_url = "rtmp://cloud/live/h1".to_string();
        let saved = store.upsert_stream(&changed).await.unwrap();

        assert_eq!(saved.stream_url, "rtmp://cloud/live/h1");
        assert_eq!(saved.process_id, Some(42));
        assert_eq!(saved.relay_state, HopState::Running);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_state_clears_publishing() {
        let store = MemoryStreamStore::new();
        let o = origin("s1", "front");
        let mut h = hop("h1", &o, "lms-1");
        h.is_publishing = true;
        store.register_streams(&[o, h]).await.unwrap();

        assert!(store
            .set_relay_process("h1", "lms-1", None, HopState::Failed)
            .await
            .unwrap());
        assert!(!store
            .set_relay_process("missing", "lms-1", None, HopState::Failed)
            .await
            .unwrap());

        let h = store
            .find_stream(&StreamFilter::new().stream_id("h1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!h.is_publishing);
        assert_eq!(h.relay_state, HopState::Failed);
    }

    #[tokio::test]
    async fn test_associated_streams_origin_first() {
        let store = MemoryStreamStore::new();
        let o = origin("s1", "front");
        let h = hop("h1", &o, "lms-1");
        // hop inserted before its origin (mirrored from a remote server)
        store.register_streams(&[h]).await.unwrap();
        store.register_streams(&[o, origin("s2", "back")]).await.unwrap();

        let lineage = store.associated_streams("s1").await.unwrap();
        assert_eq!(lineage.len(), 2);
        assert_eq!(lineage[0].kind, StreamKind::Camera);
        assert_eq!(lineage[1].stream_id, "h1");
    }

    #[tokio::test]
    async fn test_delete_requires_filter() {
        let store = MemoryStreamStore::new();
        store.register_streams(&[origin("s1", "front")]).await.unwrap();

        assert!(store.delete_streams(&StreamFilter::new()).await.is_err());
        assert_eq!(
            store
                .delete_streams(&StreamFilter::new().stream_id("s1"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.count_streams().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_streams_pages() {
        let store = MemoryStreamStore::new();
        store
            .register_streams(&[origin("s1", "a"), origin("s2", "b"), origin("s3", "c")])
            .await
            .unwrap();

        let page = store.list_streams(2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].stream_id, "s3");
    }

    #[tokio::test]
    async fn test_camera_directory() {
        let cameras = MemoryCameraDirectory::new();
        cameras.insert(Camera::new("c1", "u1", "Front door"));

        assert!(cameras.find_camera("c1").await.unwrap().is_some());
        assert!(cameras.find_camera("c2").await.unwrap().is_none());
    }
}
