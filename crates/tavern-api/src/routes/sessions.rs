//! Routes for save-slot sessions: creation, snapshots, and turns.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tavern_core::command::ServiceKey;
use tavern_core::error::DomainError;
use tavern_core::repository::PersistedSnapshot;
use tavern_session::application::turn_handlers::{
    TurnContext, handle_reroll, handle_rewind, handle_run_turn,
};
use tavern_session::domain::engine::Session;
use tavern_session::domain::turn::TurnReport;
use tavern_world_state::application::snapshots::{
    handle_load_snapshot, handle_save_snapshot, state_from_value,
};
use tavern_world_state::domain::state::GameState;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::replay::{RecordedOutputs, ReplayGenerationService};
use crate::state::AppState;

/// Request body for POST /.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// Save slot to bind the session to.
    pub slot_id: String,
    /// Initial state document. When absent the slot's snapshot is resumed,
    /// or a fresh state is started.
    #[serde(default)]
    pub state: Option<Value>,
}

/// Response body describing a session's persisted position.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    /// Save slot.
    pub slot_id: String,
    /// Current turn.
    pub turn: u32,
    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,
}

impl From<&PersistedSnapshot> for SessionResponse {
    fn from(snapshot: &PersistedSnapshot) -> Self {
        Self {
            slot_id: snapshot.slot_id.clone(),
            turn: snapshot.turn,
            saved_at: snapshot.saved_at,
        }
    }
}

/// Response body for GET /.
#[derive(Debug, Serialize)]
pub struct SlotListResponse {
    /// Every slot with a saved snapshot.
    pub slots: Vec<String>,
}

/// Request body for POST /{slot_id}/commands.
#[derive(Debug, Deserialize)]
pub struct ApplyCommandsRequest {
    /// Service the commands came from.
    #[serde(default = "default_source")]
    pub source: ServiceKey,
    /// Raw command payloads.
    pub commands: Vec<Value>,
}

fn default_source() -> ServiceKey {
    ServiceKey::State
}

/// Request body for POST /{slot_id}/turns.
#[derive(Debug, Deserialize)]
pub struct RunTurnRequest {
    /// Service input for the turn, either the serialized text or the
    /// structured document itself.
    pub input: Value,
    /// Recorded service outputs, replayed in call order.
    #[serde(default)]
    pub outputs: RecordedOutputs,
}

/// Request body for POST /{slot_id}/reroll.
#[derive(Debug, Deserialize)]
pub struct RerollRequest {
    /// Fresh service outputs for the rerun.
    #[serde(default)]
    pub outputs: RecordedOutputs,
}

/// Response body for POST /{slot_id}/rewind.
#[derive(Debug, Serialize)]
pub struct RewindResponse {
    /// The turn the session is back at.
    pub turn: u32,
}

fn input_text(input: Value) -> String {
    match input {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

async fn initial_state(
    state: &AppState,
    slot_id: &str,
    document: Option<Value>,
) -> Result<GameState, DomainError> {
    if let Some(document) = document {
        return state_from_value(document);
    }
    match handle_load_snapshot(slot_id, state.snapshot_repository.as_ref()).await {
        Ok(game) => Ok(game),
        Err(DomainError::SnapshotNotFound(_)) => Ok(GameState::default()),
        Err(e) => Err(e),
    }
}

/// Which orchestrated handler a replayed turn runs.
enum TurnRun {
    /// A new turn on the given input.
    Fresh(String),
    /// A rerun of the last committed turn.
    Reroll,
}

/// Runs a turn against posted outputs and logs what the services never
/// asked for.
async fn replay_turn(
    state: &AppState,
    session: &Session,
    outputs: RecordedOutputs,
    run: TurnRun,
) -> Result<TurnReport, DomainError> {
    let replay = ReplayGenerationService::new(outputs);
    let cancel = CancellationToken::new();
    let ctx = TurnContext {
        service: &replay,
        clock: state.clock.as_ref(),
        repo: state.snapshot_repository.as_ref(),
        cancel: &cancel,
    };
    let report = match run {
        TurnRun::Fresh(input) => handle_run_turn(session, &input, &ctx).await,
        TurnRun::Reroll => handle_reroll(session, &ctx).await,
    };
    let unused = replay.remaining();
    if unused > 0 {
        debug!(unused, "recorded outputs left unused");
    }
    report
}

/// POST /
#[instrument(skip(state, request), fields(slot = %request.slot_id))]
async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let slot_id = request.slot_id.trim().to_owned();
    if slot_id.is_empty() {
        return Err(DomainError::Validation("slot_id must not be empty".to_owned()).into());
    }
    let correlation_id = Uuid::new_v4();
    info!(%correlation_id, "creating session");

    let game = initial_state(&state, &slot_id, request.state).await?;
    let snapshot = handle_save_snapshot(
        &slot_id,
        &game,
        state.clock.as_ref(),
        state.snapshot_repository.as_ref(),
    )
    .await?;
    state
        .install(Session::new(slot_id, game, (*state.settings).clone()))
        .await?;

    Ok((StatusCode::CREATED, Json(SessionResponse::from(&snapshot))))
}

/// GET /
async fn list_slots(State(state): State<AppState>) -> Result<Json<SlotListResponse>, ApiError> {
    let slots = state.snapshot_repository.list_slots().await?;
    Ok(Json(SlotListResponse { slots }))
}

/// GET /{slot_id}
#[instrument(skip(state))]
async fn get_snapshot(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
) -> Result<Json<PersistedSnapshot>, ApiError> {
    let snapshot = state
        .snapshot_repository
        .load_snapshot(&slot_id)
        .await?
        .ok_or(DomainError::SnapshotNotFound(slot_id))?;
    Ok(Json(snapshot))
}

/// POST /{slot_id}/commands
#[instrument(skip(state, request), fields(source = %request.source))]
async fn apply_commands(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
    Json(request): Json<ApplyCommandsRequest>,
) -> Result<Json<TurnReport>, ApiError> {
    let session = state.session(&slot_id).await?;
    let mut report =
        session.apply_turn(&request.commands, request.source, state.clock.as_ref())?;

    let game = session.state().await;
    match handle_save_snapshot(
        &slot_id,
        &game,
        state.clock.as_ref(),
        state.snapshot_repository.as_ref(),
    )
    .await
    {
        Ok(_) => report.persisted = true,
        Err(e) => warn!(error = %e, "applied commands were not persisted"),
    }
    Ok(Json(report))
}

/// POST /{slot_id}/turns
#[instrument(skip(state, request))]
async fn run_turn(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
    Json(request): Json<RunTurnRequest>,
) -> Result<Json<TurnReport>, ApiError> {
    let session = state.session(&slot_id).await?;
    let input = input_text(request.input);
    info!(correlation_id = %Uuid::new_v4(), "handling run_turn");

    let report = replay_turn(&state, &session, request.outputs, TurnRun::Fresh(input)).await?;
    Ok(Json(report))
}

/// POST /{slot_id}/reroll
#[instrument(skip(state, request))]
async fn reroll(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
    Json(request): Json<RerollRequest>,
) -> Result<Json<TurnReport>, ApiError> {
    let session = state.session(&slot_id).await?;
    info!(correlation_id = %Uuid::new_v4(), "handling reroll");

    let report = replay_turn(&state, &session, request.outputs, TurnRun::Reroll).await?;
    Ok(Json(report))
}

/// POST /{slot_id}/rewind
#[instrument(skip(state))]
async fn rewind(
    State(state): State<AppState>,
    Path(slot_id): Path<String>,
) -> Result<Json<RewindResponse>, ApiError> {
    let session = state.session(&slot_id).await?;
    let replay = ReplayGenerationService::default();
    let cancel = CancellationToken::new();
    let ctx = TurnContext {
        service: &replay,
        clock: state.clock.as_ref(),
        repo: state.snapshot_repository.as_ref(),
        cancel: &cancel,
    };
    let turn = handle_rewind(&session, &ctx).await?;
    Ok(Json(RewindResponse { turn }))
}

/// Returns the router for save-slot sessions.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_session).get(list_slots))
        .route("/{slot_id}", get(get_snapshot))
        .route("/{slot_id}/commands", post(apply_commands))
        .route("/{slot_id}/turns", post(run_turn))
        .route("/{slot_id}/reroll", post(reroll))
        .route("/{slot_id}/rewind", post(rewind))
}
