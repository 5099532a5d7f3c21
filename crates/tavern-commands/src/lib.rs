//! Tavern — Commands bounded context.
//!
//! Turns raw generation-service output into canonical commands: extracts
//! the command array from loosely formatted response text (repairing broken
//! JSON along the way), normalizes each legacy command shape, and decodes
//! the typed payloads sheet and economy actions carry.

pub mod application;
pub mod domain;
