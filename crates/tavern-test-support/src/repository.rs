//! Test repositories — mock `SnapshotRepository` implementations for tests.

use std::sync::Mutex;

use async_trait::async_trait;
use tavern_core::error::DomainError;
use tavern_core::repository::{PersistedSnapshot, SnapshotRepository};

/// A snapshot repository that records every save. `load_snapshot` returns
/// the latest save for the slot, falling back to the configured snapshot.
#[derive(Debug, Default)]
pub struct RecordingSnapshotRepository {
    initial: Option<PersistedSnapshot>,
    saved: Mutex<Vec<PersistedSnapshot>>,
}

impl RecordingSnapshotRepository {
    /// Create a repository that starts out holding `initial`.
    #[must_use]
    pub fn new(initial: Option<PersistedSnapshot>) -> Self {
        Self {
            initial,
            saved: Mutex::new(Vec::new()),
        }
    }

    /// Returns every snapshot that was saved, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn saved_snapshots(&self) -> Vec<PersistedSnapshot> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl SnapshotRepository for RecordingSnapshotRepository {
    async fn load_snapshot(&self, slot_id: &str) -> Result<Option<PersistedSnapshot>, DomainError> {
        let saved = self.saved.lock().unwrap();
        let latest = saved.iter().rev().find(|s| s.slot_id == slot_id).cloned();
        Ok(latest.or_else(|| {
            self.initial
                .as_ref()
                .filter(|s| s.slot_id == slot_id)
                .cloned()
        }))
    }

    async fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> Result<(), DomainError> {
        self.saved.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<String>, DomainError> {
        let mut slots: Vec<String> = self
            .saved
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.slot_id.clone())
            .chain(self.initial.iter().map(|s| s.slot_id.clone()))
            .collect();
        slots.sort();
        slots.dedup();
        Ok(slots)
    }
}

/// A snapshot repository that holds nothing and silently accepts saves.
#[derive(Debug)]
pub struct EmptySnapshotRepository;

#[async_trait]
impl SnapshotRepository for EmptySnapshotRepository {
    async fn load_snapshot(
        &self,
        _slot_id: &str,
    ) -> Result<Option<PersistedSnapshot>, DomainError> {
        Ok(None)
    }

    async fn save_snapshot(&self, _snapshot: &PersistedSnapshot) -> Result<(), DomainError> {
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<String>, DomainError> {
        Ok(vec![])
    }
}

/// A snapshot repository that always returns an infrastructure error.
#[derive(Debug)]
pub struct FailingSnapshotRepository;

#[async_trait]
impl SnapshotRepository for FailingSnapshotRepository {
    async fn load_snapshot(
        &self,
        _slot_id: &str,
    ) -> Result<Option<PersistedSnapshot>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn save_snapshot(&self, _snapshot: &PersistedSnapshot) -> Result<(), DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn list_slots(&self) -> Result<Vec<String>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }
}
