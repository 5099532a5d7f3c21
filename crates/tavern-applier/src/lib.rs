//! Tavern — State Applier bounded context.
//!
//! Applies canonical commands onto a `GameState` one at a time. A command
//! that fails, writes out of scope, trips a fatal lock conflict or breaks
//! an invariant is rolled back on its own; the rest of the batch still
//! applies.

pub mod application;
pub mod domain;
