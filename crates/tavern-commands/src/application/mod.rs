//! Application services for the Commands context.

pub mod extraction;
