//! Snapshot stores for the Tavern engine.
//!
//! Both stores keep one snapshot per save slot; saving a slot replaces its
//! previous snapshot.

pub mod in_memory;
pub mod schema;
pub mod sqlite_snapshot_repository;
