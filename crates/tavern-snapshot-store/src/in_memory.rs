//! In-memory implementation of the `SnapshotRepository` trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use tavern_core::error::DomainError;
use tavern_core::repository::{PersistedSnapshot, SnapshotRepository};

/// Process-local snapshot repository. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotRepository {
    slots: Arc<RwLock<BTreeMap<String, PersistedSnapshot>>>,
}

impl InMemorySnapshotRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotRepository for InMemorySnapshotRepository {
    async fn load_snapshot(&self, slot_id: &str) -> Result<Option<PersistedSnapshot>, DomainError> {
        Ok(self.slots.read().await.get(slot_id).cloned())
    }

    async fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> Result<(), DomainError> {
        debug!(slot = %snapshot.slot_id, turn = snapshot.turn, "snapshot stored in memory");
        self.slots
            .write()
            .await
            .insert(snapshot.slot_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<String>, DomainError> {
        Ok(self.slots.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn snapshot(slot: &str, turn: u32) -> PersistedSnapshot {
        PersistedSnapshot {
            slot_id: slot.to_owned(),
            turn,
            payload: json!({ "turn": turn }),
            saved_at: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_missing_slot_loads_as_none() {
        let repo = InMemorySnapshotRepository::new();

        let loaded = repo.load_snapshot("nowhere").await.unwrap();

        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_the_previous_snapshot() {
        // Arrange
        let repo = InMemorySnapshotRepository::new();
        repo.save_snapshot(&snapshot("slot-a", 1)).await.unwrap();

        // Act
        repo.save_snapshot(&snapshot("slot-a", 2)).await.unwrap();

        // Assert
        let loaded = repo.load_snapshot("slot-a").await.unwrap().unwrap();
        assert_eq!(loaded.turn, 2);
        assert_eq!(repo.list_slots().await.unwrap(), vec!["slot-a".to_owned()]);
    }

    #[tokio::test]
    async fn test_clones_share_storage_and_list_sorted() {
        let repo = InMemorySnapshotRepository::new();
        let other = repo.clone();

        other.save_snapshot(&snapshot("slot-b", 1)).await.unwrap();
        repo.save_snapshot(&snapshot("slot-a", 1)).await.unwrap();

        assert_eq!(
            repo.list_slots().await.unwrap(),
            vec!["slot-a".to_owned(), "slot-b".to_owned()]
        );
    }
}
