//! Domain model for the Commands context.

pub mod call_string;
pub mod normalizer;
pub mod payloads;
