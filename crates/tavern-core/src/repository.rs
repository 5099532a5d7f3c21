//! Snapshot repository abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Stored representation of a committed game state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Save slot the snapshot belongs to.
    pub slot_id: String,
    /// Turn number at the time of the save.
    pub turn: u32,
    /// Serialized game state with transient fields stripped.
    pub payload: serde_json::Value,
    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,
}

/// Repository trait for loading and saving committed snapshots by slot.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Loads the latest snapshot for a slot, if one exists.
    async fn load_snapshot(&self, slot_id: &str) -> Result<Option<PersistedSnapshot>, DomainError>;

    /// Writes a snapshot, replacing any previous one for the same slot.
    async fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> Result<(), DomainError>;

    /// Lists every slot that has a snapshot, sorted by slot id.
    async fn list_slots(&self) -> Result<Vec<String>, DomainError>;
}
