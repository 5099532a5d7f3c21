//! Shared application state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tavern_core::clock::Clock;
use tavern_core::error::DomainError;
use tavern_core::repository::SnapshotRepository;
use tavern_session::domain::engine::Session;
use tavern_session::domain::settings::EngineSettings;
use tavern_world_state::application::snapshots::handle_load_snapshot;
use tokio::sync::RwLock;
use tracing::info;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Clock used for journal, ledger and snapshot timestamps.
    pub clock: Arc<dyn Clock>,
    /// Snapshot repository for save slots.
    pub snapshot_repository: Arc<dyn SnapshotRepository>,
    /// Settings every new session starts with.
    pub settings: Arc<EngineSettings>,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        snapshot_repository: Arc<dyn SnapshotRepository>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            clock,
            snapshot_repository,
            settings: Arc::new(settings),
            sessions: Arc::default(),
        }
    }

    /// Number of sessions held in memory.
    pub async fn live_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Installs `session` for its slot, replacing any idle session.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TurnInProgress` if the slot's current session
    /// is running a turn.
    pub async fn install(&self, session: Session) -> Result<Arc<Session>, DomainError> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session.slot_id()) {
            drop(existing.begin_turn()?);
        }
        let session = Arc::new(session);
        sessions.insert(session.slot_id().to_owned(), Arc::clone(&session));
        Ok(session)
    }

    /// The live session for `slot_id`, resumed from its snapshot on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::SnapshotNotFound` if the slot was never saved,
    /// or the repository error.
    pub async fn session(&self, slot_id: &str) -> Result<Arc<Session>, DomainError> {
        if let Some(session) = self.sessions.read().await.get(slot_id) {
            return Ok(Arc::clone(session));
        }
        let game = handle_load_snapshot(slot_id, self.snapshot_repository.as_ref()).await?;
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(slot_id.to_owned()).or_insert_with(|| {
            info!(slot = slot_id, turn = game.turn, "session resumed from snapshot");
            Arc::new(Session::new(slot_id, game, EngineSettings::clone(&self.settings)))
        });
        Ok(Arc::clone(session))
    }
}
