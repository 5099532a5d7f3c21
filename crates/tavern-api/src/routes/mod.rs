//! Route modules, one per area of the engine.

use axum::Router;

use crate::state::AppState;

pub mod health;
pub mod memory;
pub mod sessions;

/// The full route tree, without middleware or state.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/v1/sessions", sessions::router())
        .nest("/api/v1/memory", memory::router())
}
