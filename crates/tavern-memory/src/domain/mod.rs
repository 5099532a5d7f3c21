//! Domain model for the Memory context.

pub mod am_index;
pub mod pairing;
