//! Application services for the Memory context.

pub mod fill;
