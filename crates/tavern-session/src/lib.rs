//! Tavern — Session bounded context.
//!
//! Owns a session's `GameState` and runs turns against it: dispatches the
//! generation services, applies their commands, fills the memory log,
//! journals the outcome and persists the committed snapshot. Also supports
//! rerolling and rewinding the last turn.

pub mod application;
pub mod domain;
