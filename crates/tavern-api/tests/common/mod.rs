//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tavern_core::clock::Clock;
use tavern_core::repository::SnapshotRepository;
use tavern_snapshot_store::in_memory::InMemorySnapshotRepository;
use tavern_test_support::{FixedClock, sample_state};
use tower::ServiceExt;

use tavern_api::routes;
use tavern_api::state::AppState;
use tavern_session::domain::settings::EngineSettings;

/// Build the full app router over an in-memory snapshot store and a fixed
/// clock. Uses the same route tree as `main.rs`.
pub fn build_test_app() -> Router {
    build_test_app_with(Arc::new(InMemorySnapshotRepository::new()))
}

/// Build the full app router over the given snapshot repository.
pub fn build_test_app_with(repository: Arc<dyn SnapshotRepository>) -> Router {
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::default());
    let app_state = AppState::new(clock, repository, EngineSettings::default());

    routes::api_router().with_state(app_state)
}

/// The sample state as a request document.
pub fn sample_document() -> Value {
    serde_json::to_value(sample_state()).unwrap()
}

/// Create a session for `slot_id` from the sample state.
pub async fn create_sample_session(app: Router, slot_id: &str) {
    let (status, _) = post_json(
        app,
        "/api/v1/sessions",
        &json!({ "slot_id": slot_id, "state": sample_document() }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

/// Send a POST request with a JSON body and return the response.
pub async fn post_json(app: Router, uri: &str, body: &Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body_bytes).unwrap();

    (status, json)
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body_bytes).unwrap();

    (status, json)
}
