//! The session engine: one slot's `GameState` behind a turn lock.

use serde_json::Value;
use tavern_applier::application::apply::apply_batch;
use tavern_applier::domain::report::BatchReport;
use tavern_commands::domain::normalizer::normalize_batch;
use tavern_core::clock::Clock;
use tavern_core::command::ServiceKey;
use tavern_core::error::DomainError;
use tavern_core::event::{TurnJournalEntry, TurnStatus, push_journal_entry};
use tavern_rules::application::screening::screen_service_commands;
use tavern_rules::domain::scope::{DeclaredScope, ScopePolicy};
use tavern_world_state::domain::locks::LockTracker;
use tavern_world_state::domain::state::GameState;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, instrument};

use super::settings::EngineSettings;
use super::turn::{DroppedCommand, TurnPhase, TurnReport};

/// The state as it was before the last committed turn, kept for reroll and
/// rewind.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnCheckpoint {
    /// The turn that was committed on top of `before`.
    pub turn: u32,
    /// State before that turn started.
    pub before: GameState,
    /// The turn's service input.
    pub input: String,
}

/// What the turn lock protects.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Live game state.
    pub game: GameState,
    /// Pre-turn snapshot of the last committed orchestrated turn.
    pub checkpoint: Option<TurnCheckpoint>,
}

impl SessionState {
    /// Puts the game back to where it was before the last committed turn
    /// and hands back the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if no turn has been committed since
    /// the session started or was last rewound.
    pub fn restore_checkpoint(&mut self) -> Result<TurnCheckpoint, DomainError> {
        let checkpoint = self
            .checkpoint
            .take()
            .ok_or_else(|| DomainError::Validation("no committed turn to restore".to_owned()))?;
        self.game = checkpoint.before.clone();
        Ok(checkpoint)
    }

    /// Appends a journal entry for a turn outcome.
    pub fn record_outcome(
        &mut self,
        turn: u32,
        status: TurnStatus,
        batch: &BatchReport,
        note: Option<String>,
        clock: &dyn Clock,
    ) {
        let mut entry = TurnJournalEntry::new(turn, status, clock.now());
        entry.applied = batch.applied;
        entry.rejected = batch.rejected.len();
        entry.conflicts = batch.conflicts.len();
        entry.note = note;
        push_journal_entry(&mut self.game.meta.journal, entry);
    }
}

/// One save slot's live session.
///
/// Only one turn runs at a time: [`Self::begin_turn`] fails fast with
/// `DomainError::TurnInProgress` while another turn holds the lock.
#[derive(Debug)]
pub struct Session {
    slot_id: String,
    settings: EngineSettings,
    inner: Mutex<SessionState>,
}

impl Session {
    /// Creates a session around an existing state.
    #[must_use]
    pub fn new(slot_id: impl Into<String>, game: GameState, settings: EngineSettings) -> Self {
        Self {
            slot_id: slot_id.into(),
            settings,
            inner: Mutex::new(SessionState {
                game,
                checkpoint: None,
            }),
        }
    }

    /// Save slot this session writes to.
    #[must_use]
    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    /// Session settings.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Takes the turn lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TurnInProgress` if another turn holds it.
    pub fn begin_turn(&self) -> Result<MutexGuard<'_, SessionState>, DomainError> {
        self.inner.try_lock().map_err(|_| DomainError::TurnInProgress)
    }

    /// A copy of the current state, waiting for any running turn to end.
    pub async fn state(&self) -> GameState {
        self.inner.lock().await.game.clone()
    }

    /// Normalizes, screens and applies one service's raw commands as a
    /// standalone batch on the current turn, then journals the outcome.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TurnInProgress` if a turn is running. Bad
    /// commands are reported, not returned as errors.
    #[instrument(skip_all, fields(slot = %self.slot_id, source = %source, raw = raws.len()))]
    pub fn apply_turn(
        &self,
        raws: &[Value],
        source: ServiceKey,
        clock: &dyn Clock,
    ) -> Result<TurnReport, DomainError> {
        let mut session = self.begin_turn()?;
        let allowlist = self.settings.strict_allowlist();
        let mut report = TurnReport::new(session.game.turn);

        let normalized = normalize_batch(raws, source);
        report.malformed = normalized.malformed.iter().map(DroppedCommand::from).collect();
        let screened = screen_service_commands(source, normalized.commands, allowlist);
        report.guard_rejections = screened.rejected;

        let scope = ScopePolicy::new(DeclaredScope::default(), allowlist.cloned());
        let mut tracker = LockTracker::begin_turn(session.game.turn);
        let batch = apply_batch(
            &mut session.game,
            &screened.commands,
            &scope,
            &mut tracker,
            &self.settings.apply_options(),
            clock,
        );
        tracker.end_turn();
        report.absorb_batch(batch);
        report.phase = TurnPhase::TurnCommitted;

        let turn = session.game.turn;
        session.record_outcome(turn, TurnStatus::Committed, &report.batch, None, clock);
        info!(
            applied = report.batch.applied,
            rejected = report.batch.rejected.len(),
            malformed = report.malformed.len(),
            "commands applied"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tavern_test_support::{FixedClock, sample_state};

    #[test]
    fn test_apply_turn_applies_valid_commands_and_reports_the_rest() {
        // Arrange
        let session = Session::new("slot-1", sample_state(), EngineSettings::default());
        let raws = vec![
            json!({ "action": "set", "key": "gameState.location", "value": "Babel" }),
            json!({ "action": "set" }),
            json!({ "action": "add", "key": "gameState.character.currency", "value": -500 }),
        ];

        // Act
        let report = session
            .apply_turn(&raws, ServiceKey::State, &FixedClock::default())
            .unwrap();

        // Assert
        assert_eq!(report.phase, TurnPhase::TurnCommitted);
        assert_eq!(report.batch.applied, 1);
        assert_eq!(report.malformed.len(), 1);
        assert_eq!(report.batch.rejected.len(), 1);
        assert_eq!(report.batch.rejected[0].kind, "invariant-violation");
        let state = session.begin_turn().unwrap();
        assert_eq!(state.game.location, "Babel");
        assert!((state.game.character.currency - 200.0).abs() < f64::EPSILON);
        let journal = &state.game.meta.journal;
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].status, TurnStatus::Committed);
        assert_eq!(journal[0].applied, 1);
        assert_eq!(journal[0].rejected, 1);
    }

    #[test]
    fn test_second_turn_fails_fast_while_one_is_running() {
        // Arrange
        let session = Session::new("slot-1", sample_state(), EngineSettings::default());
        let _running = session.begin_turn().unwrap();

        // Act
        let result = session.apply_turn(&[], ServiceKey::State, &FixedClock::default());

        // Assert
        match result {
            Err(DomainError::TurnInProgress) => {}
            other => panic!("expected TurnInProgress, got {other:?}"),
        }
    }

    #[test]
    fn test_guard_drops_state_writes_to_the_memory_log() {
        // Arrange
        let session = Session::new("slot-1", sample_state(), EngineSettings::default());
        let raws = vec![json!({
            "action": "append_log_summary",
            "value": { "turn": 3, "summary": "Met Eina." }
        })];

        // Act
        let report = session
            .apply_turn(&raws, ServiceKey::State, &FixedClock::default())
            .unwrap();

        // Assert
        assert_eq!(report.guard_rejections.len(), 1);
        assert_eq!(report.batch.applied, 0);
    }

    #[test]
    fn test_restore_checkpoint_requires_a_committed_turn() {
        let mut state = SessionState {
            game: sample_state(),
            checkpoint: None,
        };

        let result = state.restore_checkpoint();

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_restore_checkpoint_puts_the_state_back() {
        // Arrange
        let before = sample_state();
        let mut after = before.clone();
        after.turn = 4;
        after.location = "Dungeon".to_owned();
        let mut state = SessionState {
            game: after,
            checkpoint: Some(TurnCheckpoint {
                turn: 4,
                before: before.clone(),
                input: "{}".to_owned(),
            }),
        };

        // Act
        let checkpoint = state.restore_checkpoint().unwrap();

        // Assert
        assert_eq!(checkpoint.turn, 4);
        assert_eq!(state.game, before);
        assert!(state.checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_state_returns_a_copy_once_the_turn_ends() {
        let session = Session::new("slot-1", sample_state(), EngineSettings::default());

        let state = session.state().await;

        assert_eq!(state.turn, 3);
        assert_eq!(session.slot_id(), "slot-1");
    }
}
