//! Application services for the Session context.

pub mod orchestrator;
pub mod retry;
pub mod turn_handlers;
