//! Integration tests for the session routes.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::{Value, json};
use tavern_test_support::{FailingSnapshotRepository, turn_input};

fn input() -> String {
    turn_input(4, &[("Lili", "Let's go down to the fifth floor.")], Value::Null)
}

fn spend(amount: i64) -> Value {
    json!({ "action": "add", "key": "character.currency", "value": -amount })
}

fn memory_output(summary: &str, outline: &str) -> Value {
    json!({
        "commands": [
            { "action": "append_log_summary", "value": { "summary": summary } },
            { "action": "append_log_outline", "value": { "outline": outline } }
        ]
    })
}

fn outputs(amount: i64, summary: &str) -> Value {
    json!({
        "state": [{ "commands": [spend(amount)] }],
        "memory": [memory_output(summary, "Descent")]
    })
}

fn currency(snapshot: &Value) -> f64 {
    snapshot["payload"]["character"]["currency"].as_f64().unwrap()
}

// --- create / get ---

#[tokio::test]
async fn test_create_session_persists_the_initial_state() {
    // Arrange
    let app = common::build_test_app();
    let body = json!({ "slot_id": "slot-1", "state": common::sample_document() });

    // Act
    let (status, json) = common::post_json(app.clone(), "/api/v1/sessions", &body).await;

    // Assert
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["slot_id"], "slot-1");
    assert_eq!(json["turn"], 3);
    let (status, snapshot) = common::get_json(app, "/api/v1/sessions/slot-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["turn"], 3);
    assert_eq!(snapshot["payload"]["location"], "Orario");
}

#[tokio::test]
async fn test_create_session_without_state_starts_fresh() {
    let app = common::build_test_app();

    let (status, json) =
        common::post_json(app, "/api/v1/sessions", &json!({ "slot_id": "new-game" })).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["turn"], 0);
}

#[tokio::test]
async fn test_create_session_rejects_a_blank_slot() {
    let app = common::build_test_app();

    let (status, json) =
        common::post_json(app, "/api/v1/sessions", &json!({ "slot_id": "  " })).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "validation_error");
}

#[tokio::test]
async fn test_create_session_surfaces_store_failures_as_500() {
    let app = common::build_test_app_with(Arc::new(FailingSnapshotRepository));
    let body = json!({ "slot_id": "slot-1", "state": common::sample_document() });

    let (status, json) = common::post_json(app, "/api/v1/sessions", &body).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "infrastructure_error");
}

#[tokio::test]
async fn test_get_unknown_slot_returns_404() {
    let app = common::build_test_app();

    let (status, json) = common::get_json(app, "/api/v1/sessions/nowhere").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "snapshot_not_found");
}

#[tokio::test]
async fn test_list_slots_returns_saved_slots_in_order() {
    // Arrange
    let app = common::build_test_app();
    common::create_sample_session(app.clone(), "slot-b").await;
    common::create_sample_session(app.clone(), "slot-a").await;

    // Act
    let (status, json) = common::get_json(app, "/api/v1/sessions").await;

    // Assert
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["slots"], json!(["slot-a", "slot-b"]));
}

// --- commands ---

#[tokio::test]
async fn test_commands_apply_and_report_rejections() {
    // Arrange
    let app = common::build_test_app();
    common::create_sample_session(app.clone(), "slot-1").await;
    let body = json!({
        "commands": [
            { "action": "set", "key": "gameState.location", "value": "Babel" },
            { "action": "set" },
            spend(500)
        ]
    });

    // Act
    let (status, report) =
        common::post_json(app.clone(), "/api/v1/sessions/slot-1/commands", &body).await;

    // Assert
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["batch"]["applied"], 1);
    assert_eq!(report["malformed"].as_array().unwrap().len(), 1);
    assert_eq!(report["batch"]["rejected"].as_array().unwrap().len(), 1);
    assert_eq!(report["persisted"], true);
    let (_, snapshot) = common::get_json(app, "/api/v1/sessions/slot-1").await;
    assert_eq!(snapshot["payload"]["location"], "Babel");
    assert!((currency(&snapshot) - 200.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_commands_for_an_unknown_slot_return_404() {
    let app = common::build_test_app();

    let (status, _) = common::post_json(
        app,
        "/api/v1/sessions/nowhere/commands",
        &json!({ "commands": [] }),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

// --- turns ---

#[tokio::test]
async fn test_turn_replays_outputs_and_persists_the_commit() {
    // Arrange
    let app = common::build_test_app();
    common::create_sample_session(app.clone(), "slot-1").await;
    let body = json!({ "input": input(), "outputs": outputs(30, "Left with Lili.") });

    // Act
    let (status, report) =
        common::post_json(app.clone(), "/api/v1/sessions/slot-1/turns", &body).await;

    // Assert
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["turn"], 4);
    assert_eq!(report["phase"], "turn_committed");
    assert_eq!(report["persisted"], true);
    assert!(report["pairingIssues"].as_array().unwrap().is_empty());
    let (_, snapshot) = common::get_json(app, "/api/v1/sessions/slot-1").await;
    assert_eq!(snapshot["turn"], 4);
    assert!((currency(&snapshot) - 170.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_turn_accepts_a_structured_input_document() {
    // Arrange
    let app = common::build_test_app();
    common::create_sample_session(app.clone(), "slot-1").await;
    let document: Value = serde_json::from_str(&input()).unwrap();
    let body = json!({ "input": document, "outputs": outputs(10, "Left.") });

    // Act
    let (status, report) = common::post_json(app, "/api/v1/sessions/slot-1/turns", &body).await;

    // Assert
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["turn"], 4);
}

#[tokio::test]
async fn test_turn_resumes_a_saved_slot_without_a_live_session() {
    // Arrange
    let repository = Arc::new(tavern_snapshot_store::in_memory::InMemorySnapshotRepository::new());
    let first = common::build_test_app_with(repository.clone());
    common::create_sample_session(first, "slot-1").await;
    let restarted = common::build_test_app_with(repository);
    let body = json!({ "input": input(), "outputs": outputs(30, "Left with Lili.") });

    // Act
    let (status, report) =
        common::post_json(restarted, "/api/v1/sessions/slot-1/turns", &body).await;

    // Assert
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["turn"], 4);
}

#[tokio::test]
async fn test_turn_for_an_unknown_slot_returns_404() {
    let app = common::build_test_app();
    let body = json!({ "input": input() });

    let (status, _) = common::post_json(app, "/api/v1/sessions/nowhere/turns", &body).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

// --- reroll / rewind ---

#[tokio::test]
async fn test_reroll_replaces_the_last_turn_with_new_outputs() {
    // Arrange
    let app = common::build_test_app();
    common::create_sample_session(app.clone(), "slot-1").await;
    let first = json!({ "input": input(), "outputs": outputs(30, "First") });
    common::post_json(app.clone(), "/api/v1/sessions/slot-1/turns", &first).await;
    let reroll = json!({ "outputs": outputs(40, "Second") });

    // Act
    let (status, report) =
        common::post_json(app.clone(), "/api/v1/sessions/slot-1/reroll", &reroll).await;

    // Assert
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["turn"], 4);
    let (_, snapshot) = common::get_json(app, "/api/v1/sessions/slot-1").await;
    assert_eq!(snapshot["turn"], 4);
    assert!((currency(&snapshot) - 160.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_reroll_without_a_committed_turn_returns_400() {
    let app = common::build_test_app();
    common::create_sample_session(app.clone(), "slot-1").await;

    let (status, json) =
        common::post_json(app, "/api/v1/sessions/slot-1/reroll", &json!({})).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "validation_error");
}

#[tokio::test]
async fn test_rewind_restores_and_persists_the_pre_turn_state() {
    // Arrange
    let app = common::build_test_app();
    common::create_sample_session(app.clone(), "slot-1").await;
    let body = json!({ "input": input(), "outputs": outputs(30, "Left with Lili.") });
    common::post_json(app.clone(), "/api/v1/sessions/slot-1/turns", &body).await;

    // Act
    let (status, json) =
        common::post_json(app.clone(), "/api/v1/sessions/slot-1/rewind", &json!({})).await;

    // Assert
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["turn"], 3);
    let (_, snapshot) = common::get_json(app, "/api/v1/sessions/slot-1").await;
    assert_eq!(snapshot["turn"], 3);
    assert!((currency(&snapshot) - 200.0).abs() < f64::EPSILON);
}
