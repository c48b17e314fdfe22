use async_trait::async_trait;
use sqlx::{
    postgres::{PgArguments, PgRow},
    query::Query,
    PgPool, Postgres, QueryBuilder, Row,
};

use crate::{
    models::{HopState, StreamKind, StreamRecord, StreamTelemetry},
    Error, Result,
};

/// Equality filter over stream records. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    pub stream_id: Option<String>,
    pub provenance_stream_id: Option<String>,
    pub user_id: Option<String>,
    pub camera_id: Option<String>,
    pub stream_name: Option<String>,
    pub source_server_id: Option<String>,
    pub destination_server_id: Option<String>,
    pub kind: Option<StreamKind>,
}

impl StreamFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stream_id(mut self, id: impl Into<String>) -> Self {
        self.stream_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn provenance(mut self, id: impl Into<String>) -> Self {
        self.provenance_stream_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn camera_id(mut self, id: impl Into<String>) -> Self {
        self.camera_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn source(mut self, server_id: impl Into<String>) -> Self {
        self.source_server_id = Some(server_id.into());
        self
    }

    #[must_use]
    pub fn destination(mut self, server_id: impl Into<String>) -> Self {
        self.destination_server_id = Some(server_id.into());
        self
    }

    #[must_use]
    pub const fn kind(mut self, kind: StreamKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Filter identifying the origin deduplication key.
    #[must_use]
    pub fn origin_key(user_id: &str, camera_id: &str, stream_name: &str) -> Self {
        Self::new()
            .user_id(user_id)
            .camera_id(camera_id)
            .stream_name(stream_name)
            .kind(StreamKind::Camera)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions().is_empty()
    }

    #[must_use]
    pub fn matches(&self, record: &StreamRecord) -> bool {
        let eq = |want: &Option<String>, have: &str| want.as_deref().is_none_or(|w| w == have);

        eq(&self.stream_id, &record.stream_id)
            && eq(&self.provenance_stream_id, &record.provenance_stream_id)
            && eq(&self.user_id, &record.user_id)
            && eq(&self.camera_id, &record.camera_id)
            && eq(&self.stream_name, &record.stream_name)
            && eq(&self.source_server_id, &record.source_server_id)
            && eq(&self.destination_server_id, &record.destination_server_id)
            && self.kind.is_none_or(|k| k == record.kind)
    }

    /// Column/value pairs for the set fields.
    fn conditions(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let columns = [
            ("stream_id", &self.stream_id),
            ("provenance_stream_id", &self.provenance_stream_id),
            ("user_id", &self.user_id),
            ("camera_id", &self.camera_id),
            ("stream_name", &self.stream_name),
            ("source_server_id", &self.source_server_id),
            ("destination_server_id", &self.destination_server_id),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                out.push((column, value.clone()));
            }
        }
        if let Some(kind) = self.kind {
            out.push(("kind", kind.as_str().to_string()));
        }
        out
    }

    fn push_where(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        let mut separator = " WHERE ";
        for (column, value) in self.conditions() {
            builder.push(separator).push(column).push(" = ").push_bind(value);
            separator = " AND ";
        }
    }
}

/// Persistence of stream lineages.
///
/// Records are keyed by `(stream_id, destination_server_id)`. At most one
/// `camera` record may exist per `(user_id, camera_id, stream_name)`;
/// violations surface as [`Error::AlreadyExists`].
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// First matching record in creation order.
    async fn find_stream(&self, filter: &StreamFilter) -> Result<Option<StreamRecord>>;

    async fn list_streams(&self, limit: i64, offset: i64) -> Result<Vec<StreamRecord>>;

    async fn count_streams(&self) -> Result<u64>;

    /// Insert every record or none of them.
    async fn register_streams(&self, records: &[StreamRecord]) -> Result<()>;

    /// Insert or update the lineage fields of a record.
    ///
    /// Process and status columns of an existing record are kept.
    async fn upsert_stream(&self, record: &StreamRecord) -> Result<StreamRecord>;

    /// Record the relay process of a hop. `Failed` and `Stopped` also clear
    /// `is_publishing`. Returns false when no such record exists.
    async fn set_relay_process(
        &self,
        stream_id: &str,
        destination_server_id: &str,
        process_id: Option<u32>,
        state: HopState,
    ) -> Result<bool>;

    async fn delete_streams(&self, filter: &StreamFilter) -> Result<u64>;

    /// Every record of the lineage rooted at `provenance_stream_id`, origin first.
    async fn associated_streams(&self, provenance_stream_id: &str) -> Result<Vec<StreamRecord>>;
}

const STREAM_COLUMNS: &str = "stream_id, destination_server_id, provenance_stream_id, user_id, \
     camera_id, source_server_id, process_id, stream_name, stream_url, kind, stream_type, \
     is_public, is_active, is_publishing, is_stable, relay_state, codec, resolution, frame_rate, \
     bandwidth_in, bandwidth_out, bytes_in, bytes_out, total_clients, active_time, last_active, \
     created_at, updated_at";

const INSERT_STREAM: &str = "INSERT INTO streams (
        stream_id, destination_server_id, provenance_stream_id, user_id,
        camera_id, source_server_id, process_id, stream_name, stream_url,
        kind, stream_type, is_public, is_active, is_publishing, is_stable,
        relay_state, created_at, updated_at
     )
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)";

/// `PostgreSQL` lineage store.
#[derive(Clone)]
pub struct PgStreamStore {
    pool: PgPool,
}

impl PgStreamStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn bind_insert<'q>(
        query: Query<'q, Postgres, PgArguments>,
        record: &'q StreamRecord,
    ) -> Query<'q, Postgres, PgArguments> {
        query
            .bind(&record.stream_id)
            .bind(&record.destination_server_id)
            .bind(&record.provenance_stream_id)
            .bind(&record.user_id)
            .bind(&record.camera_id)
            .bind(&record.source_server_id)
            .bind(record.process_id.map(i64::from))
            .bind(&record.stream_name)
            .bind(&record.stream_url)
            .bind(record.kind.as_str())
            .bind(record.stream_type.as_str())
            .bind(record.is_public)
            .bind(record.is_active)
            .bind(record.is_publishing)
            .bind(record.is_stable)
            .bind(record.relay_state.as_str())
            .bind(record.created_at)
            .bind(record.updated_at)
    }

    fn row_to_stream(row: &PgRow) -> Result<StreamRecord> {
        let kind: String = row.try_get("kind")?;
        let stream_type: String = row.try_get("stream_type")?;
        let relay_state: String = row.try_get("relay_state")?;
        let process_id: Option<i64> = row.try_get("process_id")?;
        let process_id = process_id
            .map(u32::try_from)
            .transpose()
            .map_err(|_| Error::Internal("process_id out of range".to_string()))?;

        Ok(StreamRecord {
            stream_id: row.try_get("stream_id")?,
            provenance_stream_id: row.try_get("provenance_stream_id")?,
            user_id: row.try_get("user_id")?,
            camera_id: row.try_get("camera_id")?,
            source_server_id: row.try_get("source_server_id")?,
            destination_server_id: row.try_get("destination_server_id")?,
            process_id,
            stream_name: row.try_get("stream_name")?,
            stream_url: row.try_get("stream_url")?,
            kind: kind.parse()?,
            stream_type: stream_type.parse()?,
            is_public: row.try_get("is_public")?,
            is_active: row.try_get("is_active")?,
            is_publishing: row.try_get("is_publishing")?,
            is_stable: row.try_get("is_stable")?,
            relay_state: relay_state.parse()?,
            telemetry: StreamTelemetry {
                codec: row.try_get("codec")?,
                resolution: row.try_get("resolution")?,
                frame_rate: row.try_get("frame_rate")?,
                bandwidth_in: row.try_get("bandwidth_in")?,
                bandwidth_out: row.try_get("bandwidth_out")?,
                bytes_in: row.try_get("bytes_in")?,
                bytes_out: row.try_get("bytes_out")?,
                total_clients: row.try_get("total_clients")?,
                active_time: row.try_get("active_time")?,
                last_active: row.try_get("last_active")?,
            },
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl StreamStore for PgStreamStore {
    async fn find_stream(&self, filter: &StreamFilter) -> Result<Option<StreamRecord>> {
        let mut builder = QueryBuilder::new(format!("SELECT {STREAM_COLUMNS} FROM streams"));
        filter.push_where(&mut builder);
        builder.push(" ORDER BY created_at ASC LIMIT 1");

        let row = builder.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_stream).transpose()
    }

    async fn list_streams(&self, limit: i64, offset: i64) -> Result<Vec<StreamRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams
             ORDER BY created_at ASC, stream_id ASC
             LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_stream).collect()
    }

    async fn count_streams(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM streams")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn register_streams(&self, records: &[StreamRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            Self::bind_insert(sqlx::query(INSERT_STREAM), record)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_stream(&self, record: &StreamRecord) -> Result<StreamRecord> {
        let sql = format!(
            "{INSERT_STREAM}
             ON CONFLICT (stream_id, destination_server_id) DO UPDATE
             SET
                provenance_stream_id = EXCLUDED.provenance_stream_id,
                user_id = EXCLUDED.user_id,
                camera_id = EXCLUDED.camera_id,
                source_server_id = EXCLUDED.source_server_id,
                stream_name = EXCLUDED.stream_name,
                stream_url = EXCLUDED.stream_url,
                stream_type = EXCLUDED.stream_type,
                is_public = EXCLUDED.is_public,
                is_active = TRUE,
                updated_at = EXCLUDED.updated_at
             RETURNING {STREAM_COLUMNS}"
        );

        let row = Self::bind_insert(sqlx::query(&sql), record)
            .fetch_one(&self.pool)
            .await?;

        Self::row_to_stream(&row)
    }

    async fn set_relay_process(
        &self,
        stream_id: &str,
        destination_server_id: &str,
        process_id: Option<u32>,
        state: HopState,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE streams
             SET process_id = $3,
                 relay_state = $4,
                 is_publishing = CASE WHEN $4 IN ('failed', 'stopped') THEN FALSE ELSE is_publishing END,
                 updated_at = NOW()
             WHERE stream_id = $1 AND destination_server_id = $2",
        )
        .bind(stream_id)
        .bind(destination_server_id)
        .bind(process_id.map(i64::from))
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_streams(&self, filter: &StreamFilter) -> Result<u64> {
        if filter.is_empty() {
            return Err(Error::InvalidInput(
                "Refusing to delete streams without a filter".to_string(),
            ));
        }

        let mut builder = QueryBuilder::new("DELETE FROM streams");
        filter.push_where(&mut builder);

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn associated_streams(&self, provenance_stream_id: &str) -> Result<Vec<StreamRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams
             WHERE provenance_stream_id = $1
             ORDER BY (kind = 'camera') DESC, created_at ASC"
        ))
        .bind(provenance_stream_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_stream).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RegisterDraft, StreamType};

    fn origin() -> StreamRecord {
        let draft = RegisterDraft {
            camera_id: "c1".to_string(),
            stream_name: "front-door".to_string(),
            stream_url: "rtsp://10.0.0.5/1".to_string(),
            is_public: false,
            stream_type: StreamType::Rtsp,
        };
        StreamRecord::origin("s1".to_string(), "u1", "lms-1", &draft)
    }

    #[test]
    fn test_filter_matches() {
        let record = origin();

        assert!(StreamFilter::new().matches(&record));
        assert!(StreamFilter::new().stream_id("s1").destination("lms-1").matches(&record));
        assert!(StreamFilter::origin_key("u1", "c1", "front-door").matches(&record));
        assert!(!StreamFilter::new().kind(StreamKind::Rtmp).matches(&record));
        assert!(!StreamFilter::new().stream_id("s1").destination("cms-1").matches(&record));
    }

    #[test]
    fn test_filter_builds_parameterised_where() {
        let filter = StreamFilter::new().stream_id("s1").kind(StreamKind::Camera);
        let mut builder = QueryBuilder::<Postgres>::new("DELETE FROM streams");
        filter.push_where(&mut builder);

        assert_eq!(
            builder.sql(),
            "DELETE FROM streams WHERE stream_id = $1 AND kind = $2"
        );
    }

    #[test]
    fn test_empty_filter() {
        assert!(StreamFilter::new().is_empty());
        assert!(!StreamFilter::new().provenance("s1").is_empty());
    }
}
