//! Domain model for the Session context.

pub mod engine;
pub mod settings;
pub mod turn;
