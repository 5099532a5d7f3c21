//! Tavern — Narrative bounded context.
//!
//! Reads the structured turn payload a state service was given and fills
//! in writes the service forgot: money mentioned in prose but never
//! booked, and characters who speak but were never registered.

pub mod application;
pub mod domain;
