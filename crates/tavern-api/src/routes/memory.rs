//! Routes for the memory tables.

use axum::extract::State;
use axum::{Json, Router, routing::post};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tavern_core::error::DomainError;
use tavern_memory::domain::pairing::{PairingIssue, check_pairing};
use tavern_world_state::application::snapshots::state_from_value;
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /pairing-check.
#[derive(Debug, Deserialize)]
pub struct PairingCheckRequest {
    /// State document to inspect. When absent, `slot_id` names a live or
    /// saved session instead.
    #[serde(default)]
    pub state: Option<Value>,
    /// Save slot to inspect.
    #[serde(default)]
    pub slot_id: Option<String>,
}

/// Response body for POST /pairing-check.
#[derive(Debug, Serialize)]
pub struct PairingCheckResponse {
    /// Summary rows inspected.
    pub summaries: usize,
    /// Outline rows inspected.
    pub outlines: usize,
    /// Broken pairs, ordered by turn.
    pub issues: Vec<PairingIssue>,
}

/// POST /pairing-check
#[instrument(skip_all)]
async fn pairing_check(
    State(state): State<AppState>,
    Json(request): Json<PairingCheckRequest>,
) -> Result<Json<PairingCheckResponse>, ApiError> {
    let game = match (request.state, request.slot_id) {
        (Some(document), _) => state_from_value(document)?,
        (None, Some(slot_id)) => {
            let session = state.session(&slot_id).await?;
            session.state().await
        }
        (None, None) => {
            return Err(DomainError::Validation(
                "either state or slot_id is required".to_owned(),
            )
            .into());
        }
    };

    let issues = check_pairing(&game);
    info!(issues = issues.len(), "pairing checked");
    Ok(Json(PairingCheckResponse {
        summaries: game.summaries.len(),
        outlines: game.outlines.len(),
        issues,
    }))
}

/// Returns the router for the memory tables.
pub fn router() -> Router<AppState> {
    Router::new().route("/pairing-check", post(pairing_check))
}
