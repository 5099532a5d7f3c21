//! Domain model for the Narrative context.

pub mod currency;
pub mod econ_fallback;
pub mod fallback;
pub mod npc_fallback;
pub mod payload;
