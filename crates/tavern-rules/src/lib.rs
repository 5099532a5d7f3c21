//! Tavern — Rules bounded context.
//!
//! Decides what a service is allowed to write (declared scope, strict
//! field allowlist, per-service ownership) and which states are legal
//! (currency, resource bounds, affinity range).

pub mod application;
pub mod domain;
