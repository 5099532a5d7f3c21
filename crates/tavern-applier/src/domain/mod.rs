//! Domain model for the State Applier context.

pub mod economy;
pub mod gate;
pub mod mutation;
pub mod report;
pub mod sheets;
