//! Domain model for the Rules context.

pub mod guard;
pub mod invariants;
pub mod scope;
