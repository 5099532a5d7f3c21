//! Tavern Core — shared domain abstractions.
//!
//! This crate defines the vocabulary every other crate in the engine speaks:
//! canonical commands, sheet identifiers, the generation-service contract,
//! the snapshot repository, and the domain error type. It contains no
//! infrastructure code.

pub mod clock;
pub mod command;
pub mod error;
pub mod event;
pub mod repository;
pub mod service;
pub mod sheet;
