use serde::{Deserialize, Serialize};
use std::fmt;

use super::{BackendId, FrontId};

/// Opaque key selecting the Strategy / SyncAdapter for an entity (e.g. `"note"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity envelope of an entity: the stable front id plus the backend id once known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub front_id: FrontId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<BackendId>,
}

impl EntityRef {
    pub fn new(front_id: FrontId) -> Self {
        Self {
            front_id,
            backend_id: None,
        }
    }

    pub fn with_backend_id(mut self, backend_id: BackendId) -> Self {
        self.backend_id = Some(backend_id);
        self
    }
}
