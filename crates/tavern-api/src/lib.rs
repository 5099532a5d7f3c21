//! Tavern engine — HTTP API library.
//!
//! Exposes the route modules, application state, and error types so that
//! integration tests can build the router without starting a server.

pub mod error;
pub mod replay;
pub mod routes;
pub mod state;
