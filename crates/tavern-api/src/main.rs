//! Tavern engine API server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use tavern_api::error::AppError;
use tavern_api::routes;
use tavern_api::state::AppState;
use tavern_core::clock::SystemClock;
use tavern_session::domain::settings::EngineSettings;
use tavern_snapshot_store::sqlite_snapshot_repository::SqliteSnapshotRepository;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize tracing subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting Tavern engine API server");

    // Read configuration from environment.
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());
    if database_url.contains(":memory:") {
        tracing::warn!("DATABASE_URL not set, snapshots will not survive a restart");
    }
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .map_err(|e| AppError::Config(format!("PORT must be a valid u16: {e}")))?;
    let settings = EngineSettings::load()?;

    // Open the snapshot store.
    let repository = SqliteSnapshotRepository::connect(&database_url).await?;

    // Build application state.
    let app_state = AppState::new(Arc::new(SystemClock), Arc::new(repository), settings);

    let app = routes::api_router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    // Start server.
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
