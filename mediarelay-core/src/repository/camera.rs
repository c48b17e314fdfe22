use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::{models::Camera, Result};

/// Read access to the cameras known to this server.
#[async_trait]
pub trait CameraDirectory: Send + Sync {
    async fn find_camera(&self, camera_id: &str) -> Result<Option<Camera>>;
}

#[derive(Clone)]
pub struct PgCameraRepository {
    pool: PgPool,
}

impl PgCameraRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CameraDirectory for PgCameraRepository {
    async fn find_camera(&self, camera_id: &str) -> Result<Option<Camera>> {
        let row = sqlx::query(
            "SELECT camera_id, user_id, name, created_at
             FROM cameras
             WHERE camera_id = $1",
        )
        .bind(camera_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Camera {
                camera_id: row.try_get("camera_id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
                created_at: row.try_get("created_at")?,
            })),
            None => Ok(None),
        }
    }
}
