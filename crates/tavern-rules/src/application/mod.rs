//! Application services for the Rules context.

pub mod screening;
