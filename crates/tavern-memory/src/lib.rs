//! Tavern — Memory bounded context.
//!
//! Maintains the derived memory log: per-turn summary and outline rows
//! paired through a shared AM-code. Asks the memory service to fill the
//! log, deduplicates what comes back, and requests targeted repairs when a
//! turn is left with only one half of its pair.

pub mod application;
pub mod domain;
