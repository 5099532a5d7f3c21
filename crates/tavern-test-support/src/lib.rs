//! Shared test mocks and utilities for the Tavern engine.

mod clock;
mod fixtures;
mod generation;
mod repository;

pub use clock::FixedClock;
pub use fixtures::{npc, sample_state, state_with_balance, turn_input};
pub use generation::{ScriptedCall, ScriptedGenerationService};
pub use repository::{
    EmptySnapshotRepository, FailingSnapshotRepository, RecordingSnapshotRepository,
};
