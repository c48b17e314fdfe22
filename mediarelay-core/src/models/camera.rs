use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera owned by a user. Registration only checks existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    pub camera_id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Camera {
    #[must_use]
    pub fn new(camera_id: impl Into<String>, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            user_id: user_id.into(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}
