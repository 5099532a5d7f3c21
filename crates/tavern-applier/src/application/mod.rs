//! Application services for the State Applier context.

pub mod apply;
