//! Rider profiles: the enrichment record shown next to every rider, typist
//! and message sender.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::collab::{Filter, Persistence};
use crate::core::enrichment::EnrichmentSource;
use crate::error::SyncError;

/// Backing table of rider profiles.
pub const PROFILES_TABLE: &str = "profiles";

/// Slow-changing attributes of a rider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiderProfile {
    /// Name shown on the map and in chats.
    #[serde(default)]
    pub display_name: String,
    /// Avatar image location in the blob store.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Rider level (gamification).
    #[serde(default)]
    pub level: u32,
}

/// Resolves `RiderProfile`s from the `profiles` table, matching `id = user`.
pub struct PersistedProfiles {
    persistence: Arc<dyn Persistence>,
}

impl PersistedProfiles {
    /// Source reading through `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl EnrichmentSource<RiderProfile> for PersistedProfiles {
    async fn fetch(&self, entity_id: &str) -> Result<Option<RiderProfile>, SyncError> {
        let rows = self
            .persistence
            .query(PROFILES_TABLE, &Filter::all().eq("id", entity_id))
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_value(row.payload)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_reads_profile_by_id() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            PROFILES_TABLE,
            "u1",
            json!({ "id": "u1", "display_name": "Valentina", "level": 7 }),
            1,
        );
        let source = PersistedProfiles::new(backend);

        let profile = source.fetch("u1").await.expect("query ok");
        assert_eq!(
            profile,
            Some(RiderProfile {
                display_name: "Valentina".into(),
                avatar_url: None,
                level: 7,
            })
        );
        assert_eq!(source.fetch("nobody").await, Ok(None));
    }

    #[tokio::test]
    async fn test_malformed_profile_is_decode_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(PROFILES_TABLE, "u1", json!({ "id": "u1", "level": "max" }), 1);
        let source = PersistedProfiles::new(backend);

        assert!(matches!(source.fetch("u1").await, Err(SyncError::Decode(_))));
    }
}
