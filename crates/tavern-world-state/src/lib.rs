//! Tavern — World State bounded context.
//!
//! Owns the `GameState` document: typed sheets, the enum-driven path
//! resolver used by legacy path commands, row/cell lock tracking, derived
//! stat recomputation, and snapshot preparation for persistence.

pub mod application;
pub mod domain;
