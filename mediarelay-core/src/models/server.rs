use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tier a media server belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Cloud media server
    Cms,
    /// Local media server
    Lms,
}

impl ServerRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cms => "cms",
            Self::Lms => "lms",
        }
    }

    /// Namespace under which this server derives stream ids (`"<role>Stream"`).
    ///
    /// Two servers of the same role derive identical ids for identical
    /// inputs; servers of different roles never collide.
    #[must_use]
    pub fn stream_namespace(&self) -> Uuid {
        let name = format!("{}Stream", self.as_str());
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

impl Default for ServerRole {
    fn default() -> Self {
        Self::Lms
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker topic a server consumes requests and responses from.
#[must_use]
pub fn downstream_topic(server_id: &str) -> String {
    format!("{server_id}.downstream")
}

/// Derive a stream id under `namespace` from the given name parts.
///
/// The parts are joined with `/`, so `["u1", "c1", "front"]` and
/// `["u1/c1", "front"]` intentionally collide.
#[must_use]
pub fn derive_stream_id(namespace: &Uuid, parts: &[&str]) -> String {
    let name = parts.join("/");
    Uuid::new_v5(namespace, name.as_bytes()).to_string()
}
