//! Snapshot handlers for the World State context.
//!
//! Converts between the live `GameState` and its persisted form, dropping
//! transient fields on the way out.

use serde_json::Value;
use tavern_core::clock::Clock;
use tavern_core::error::DomainError;
use tavern_core::repository::{PersistedSnapshot, SnapshotRepository};
use tracing::{info, instrument};

use crate::domain::state::GameState;

/// Removes fields that must never be persisted: raw per-line service
/// responses.
pub fn strip_transient(state: &mut GameState) {
    for entry in &mut state.log {
        entry.raw_response = None;
    }
}

/// Builds the persisted form of a state.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if the state cannot be serialized.
pub fn to_persisted(
    slot_id: &str,
    state: &GameState,
    clock: &dyn Clock,
) -> Result<PersistedSnapshot, DomainError> {
    let mut stripped = state.clone();
    strip_transient(&mut stripped);
    let payload = serde_json::to_value(&stripped)
        .map_err(|e| DomainError::Infrastructure(format!("failed to serialize state: {e}")))?;
    Ok(PersistedSnapshot {
        slot_id: slot_id.to_owned(),
        turn: state.turn,
        payload,
        saved_at: clock.now(),
    })
}

/// Restores a state from a persisted snapshot.
///
/// # Errors
///
/// Returns `DomainError::Validation` if the payload is not a valid state.
pub fn from_persisted(snapshot: &PersistedSnapshot) -> Result<GameState, DomainError> {
    state_from_value(snapshot.payload.clone())
}

/// Decodes a state document.
///
/// # Errors
///
/// Returns `DomainError::Validation` if the value is not a valid state.
pub fn state_from_value(value: Value) -> Result<GameState, DomainError> {
    serde_json::from_value(value)
        .map_err(|e| DomainError::Validation(format!("invalid game state: {e}")))
}

/// Persists the state of a slot.
///
/// # Errors
///
/// Returns `DomainError` if serialization or the repository write fails.
#[instrument(skip(state, clock, repo), fields(turn = state.turn))]
pub async fn handle_save_snapshot(
    slot_id: &str,
    state: &GameState,
    clock: &dyn Clock,
    repo: &dyn SnapshotRepository,
) -> Result<PersistedSnapshot, DomainError> {
    let snapshot = to_persisted(slot_id, state, clock)?;
    repo.save_snapshot(&snapshot).await?;
    info!("snapshot saved");
    Ok(snapshot)
}

/// Loads the state of a slot.
///
/// # Errors
///
/// Returns `DomainError::SnapshotNotFound` if the slot has never been saved,
/// or the repository/decoding error.
#[instrument(skip(repo))]
pub async fn handle_load_snapshot(
    slot_id: &str,
    repo: &dyn SnapshotRepository,
) -> Result<GameState, DomainError> {
    let snapshot = repo
        .load_snapshot(slot_id)
        .await?
        .ok_or_else(|| DomainError::SnapshotNotFound(slot_id.to_owned()))?;
    from_persisted(&snapshot)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use tavern_core::clock::Clock;
    use tavern_core::error::DomainError;
    use tavern_core::repository::{PersistedSnapshot, SnapshotRepository};

    use super::*;
    use crate::domain::state::NarrativeLogEntry;

    #[derive(Debug)]
    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[derive(Debug, Default)]
    struct MockSnapshotRepository {
        saved: Mutex<Vec<PersistedSnapshot>>,
    }

    #[async_trait::async_trait]
    impl SnapshotRepository for MockSnapshotRepository {
        async fn load_snapshot(
            &self,
            slot_id: &str,
        ) -> Result<Option<PersistedSnapshot>, DomainError> {
            Ok(self
                .saved
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|s| s.slot_id == slot_id)
                .cloned())
        }

        async fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> Result<(), DomainError> {
            self.saved.lock().unwrap().push(snapshot.clone());
            Ok(())
        }

        async fn list_slots(&self) -> Result<Vec<String>, DomainError> {
            Ok(self
                .saved
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.slot_id.clone())
                .collect())
        }
    }

    fn state_with_raw_line() -> GameState {
        let mut state = GameState {
            turn: 4,
            ..GameState::default()
        };
        state.log.push(NarrativeLogEntry {
            sender: "Eina".into(),
            text: "Welcome back.".into(),
            turn: 4,
            raw_response: Some("{\"tavern_commands\":[]}".into()),
        });
        state
    }

    #[test]
    fn test_to_persisted_strips_raw_responses() {
        // Arrange
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        let state = state_with_raw_line();

        // Act
        let snapshot = to_persisted("slot-1", &state, &clock).unwrap();

        // Assert
        assert_eq!(snapshot.turn, 4);
        assert_eq!(snapshot.saved_at, clock.0);
        assert!(snapshot.payload["log"][0].get("raw_response").is_none());
        assert_eq!(
            state.log[0].raw_response.as_deref(),
            Some("{\"tavern_commands\":[]}")
        );
    }

    #[tokio::test]
    async fn test_save_then_load_restores_state() {
        // Arrange
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        let repo = MockSnapshotRepository::default();
        let mut state = state_with_raw_line();
        state.character.currency = 250.0;

        // Act
        handle_save_snapshot("slot-1", &state, &clock, &repo)
            .await
            .unwrap();
        let restored = handle_load_snapshot("slot-1", &repo).await.unwrap();

        // Assert
        assert!((restored.character.currency - 250.0).abs() < f64::EPSILON);
        assert_eq!(restored.turn, 4);
        assert_eq!(restored.log[0].raw_response, None);
    }

    #[tokio::test]
    async fn test_load_missing_slot_returns_not_found() {
        let repo = MockSnapshotRepository::default();

        let result = handle_load_snapshot("nope", &repo).await;

        match result {
            Err(DomainError::SnapshotNotFound(slot)) => assert_eq!(slot, "nope"),
            other => panic!("expected SnapshotNotFound, got {other:?}"),
        }
    }
}
