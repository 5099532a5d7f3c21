//! Turn handlers for the Session context.
//!
//! A turn runs on a copy of the session's state: the state service is
//! dispatched and applied, then the memory service fills the log and broken
//! pairs are repaired. Only a completed turn replaces the live state. A
//! cancelled or failed turn leaves the prior state in place, adds a system
//! note and journals the outcome.

use serde_json::Value;
use tavern_applier::application::apply::apply_batch;
use tavern_applier::domain::report::BatchReport;
use tavern_core::clock::Clock;
use tavern_core::command::ServiceKey;
use tavern_core::error::DomainError;
use tavern_core::event::TurnStatus;
use tavern_core::repository::SnapshotRepository;
use tavern_core::service::GenerationService;
use tavern_memory::application::fill::{FillRequest, request_pairing_repair};
use tavern_memory::domain::pairing::{align_codes, check_pairing, purge_turn};
use tavern_narrative::domain::payload::TurnPayload;
use tavern_rules::domain::scope::{DeclaredScope, ScopePolicy};
use tavern_world_state::application::snapshots::handle_save_snapshot;
use tavern_world_state::domain::locks::LockTracker;
use tavern_world_state::domain::state::{GameState, NarrativeLogEntry};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::orchestrator::{DispatchContext, dispatch};
use super::retry::RetryingService;
use crate::domain::engine::{Session, SessionState, TurnCheckpoint};
use crate::domain::settings::EngineSettings;
use crate::domain::turn::TurnReport;

/// Collaborators of one turn.
#[derive(Clone, Copy)]
pub struct TurnContext<'a> {
    /// The generation collaborator.
    pub service: &'a dyn GenerationService,
    /// Time source for ledger and journal entries.
    pub clock: &'a dyn Clock,
    /// Where committed states are persisted.
    pub repo: &'a dyn SnapshotRepository,
    /// Cancels the turn.
    pub cancel: &'a CancellationToken,
}

fn service_snapshot(game: &GameState) -> Result<Value, DomainError> {
    serde_json::to_value(game)
        .map_err(|e| DomainError::Infrastructure(format!("failed to serialize state: {e}")))
}

fn resolve_narrative(game: &mut GameState, payload: Option<&TurnPayload>) {
    game.turn += 1;
    let Some(payload) = payload else {
        return;
    };
    if let Some(time) = &payload.game_time {
        game.game_time.clone_from(time);
    }
    if let Some(location) = &payload.location {
        game.location.clone_from(location);
    }
    for line in payload.narrative_lines() {
        game.log.push(NarrativeLogEntry {
            sender: line.speaker,
            text: line.text,
            turn: game.turn,
            raw_response: None,
        });
    }
}

async fn fill_and_pair(
    game: &mut GameState,
    input: &str,
    settings: &EngineSettings,
    dispatch_ctx: &DispatchContext<'_>,
    tracker: &mut LockTracker,
    clock: &dyn Clock,
    report: &mut TurnReport,
) -> Result<(), DomainError> {
    let options = settings.apply_options();
    let scope = ScopePolicy::new(
        DeclaredScope {
            required_sheets: settings.memory.target_sheets.clone(),
            target_sheet: None,
        },
        None,
    );

    let filled = dispatch(ServiceKey::Memory.as_str(), input, game, dispatch_ctx).await?;
    let mut memory = filled.memory.unwrap_or_default();
    report.note_repair(filled.repair_note);
    report.absorb_batch(apply_batch(
        game,
        &filled.commands,
        &scope,
        tracker,
        &options,
        clock,
    ));
    memory.realigned = align_codes(game);

    let issues = check_pairing(game);
    if issues.iter().any(|issue| issue.missing_sheet().is_some()) {
        let snapshot = service_snapshot(game)?;
        let request = FillRequest {
            input,
            snapshot: &snapshot,
            settings: dispatch_ctx.settings,
            turn: game.turn,
        };
        let repair = request_pairing_repair(
            dispatch_ctx.service,
            request,
            &issues,
            dispatch_ctx.memory,
            dispatch_ctx.cancel,
        )
        .await?;
        memory.absorb(&repair);
        memory.repaired = true;
        report.note_repair(repair.repair_note());
        report.absorb_batch(apply_batch(
            game,
            &repair.commands,
            &scope,
            tracker,
            &options,
            clock,
        ));
        memory.realigned.extend(align_codes(game));
        memory.realigned.sort_unstable();
        memory.realigned.dedup();
    }
    report.pairing_issues = check_pairing(game);
    report.memory = Some(memory);
    Ok(())
}

async fn run_phases(
    game: &mut GameState,
    input: &str,
    settings: &EngineSettings,
    ctx: &TurnContext<'_>,
) -> Result<TurnReport, DomainError> {
    let payload = TurnPayload::parse(input);
    resolve_narrative(game, payload.as_ref());
    let mut report = TurnReport::new(game.turn);

    let allowlist = settings.strict_allowlist();
    let retrying = RetryingService::new(ctx.service, &settings.retry);
    let mut tracker = LockTracker::begin_turn(game.turn);

    report.advance();
    let snapshot = service_snapshot(game)?;
    let dispatch_ctx = DispatchContext {
        service: &retrying,
        snapshot: &snapshot,
        settings: &settings.service,
        allowlist,
        memory: &settings.memory,
        cancel: ctx.cancel,
    };
    let state_out = dispatch(ServiceKey::State.as_str(), input, game, &dispatch_ctx).await?;
    report.malformed = state_out.malformed;
    report.guard_rejections = state_out.guard_rejections;
    report.synthesis = state_out.synthesis;
    report.note_repair(state_out.repair_note);
    let declared = payload
        .as_ref()
        .map(TurnPayload::declared_scope)
        .unwrap_or_default();
    let scope = ScopePolicy::new(declared, allowlist.cloned());
    report.absorb_batch(apply_batch(
        game,
        &state_out.commands,
        &scope,
        &mut tracker,
        &settings.apply_options(),
        ctx.clock,
    ));
    report.advance();

    report.advance();
    let snapshot = service_snapshot(game)?;
    let memory_ctx = DispatchContext {
        snapshot: &snapshot,
        ..dispatch_ctx
    };
    fill_and_pair(
        game,
        input,
        settings,
        &memory_ctx,
        &mut tracker,
        ctx.clock,
        &mut report,
    )
    .await?;
    report.advance();

    tracker.end_turn();
    report.advance();
    Ok(report)
}

async fn persist(slot_id: &str, game: &GameState, ctx: &TurnContext<'_>) -> bool {
    match handle_save_snapshot(slot_id, game, ctx.clock, ctx.repo).await {
        Ok(_) => true,
        Err(error) => {
            warn!(slot = slot_id, error = %error, "snapshot not persisted");
            false
        }
    }
}

/// Runs a turn on a copy of `base` and, on success, makes it the live
/// state with `base` as the new checkpoint. On failure the live state is
/// left as it was apart from the note and journal entry.
async fn execute_turn(
    session: &Session,
    state: &mut SessionState,
    base: GameState,
    input: &str,
    ctx: &TurnContext<'_>,
) -> Result<TurnReport, DomainError> {
    let mut working = base.clone();
    let attempted = base.turn + 1;
    let outcome = tokio::select! {
        () = ctx.cancel.cancelled() => Err(DomainError::Aborted),
        result = run_phases(&mut working, input, session.settings(), ctx) => result,
    };

    match outcome {
        Ok(mut report) => {
            state.game = working;
            state.checkpoint = Some(TurnCheckpoint {
                turn: report.turn,
                before: base,
                input: input.to_owned(),
            });
            let turn = report.turn;
            state.record_outcome(turn, TurnStatus::Committed, &report.batch, None, ctx.clock);
            report.persisted = persist(session.slot_id(), &state.game, ctx).await;
            info!(
                turn = report.turn,
                applied = report.batch.applied,
                rejected = report.batch.rejected.len(),
                pairing_issues = report.pairing_issues.len(),
                "turn committed"
            );
            Ok(report)
        }
        Err(error) => {
            let (status, note) = match &error {
                DomainError::Aborted => {
                    (TurnStatus::Cancelled, format!("turn {attempted} cancelled"))
                }
                other => (TurnStatus::Failed, format!("turn {attempted} failed: {other}")),
            };
            warn!(turn = attempted, status = ?status, error = %error, "turn discarded");
            state.game.push_system_note(note.clone());
            let empty = BatchReport::default();
            state.record_outcome(attempted, status, &empty, Some(note), ctx.clock);
            persist(session.slot_id(), &state.game, ctx).await;
            Err(error)
        }
    }
}

/// Runs one orchestrated turn for the session.
///
/// # Errors
///
/// Returns `DomainError::TurnInProgress` if another turn is running, and
/// the turn-ending error (`ServiceUnavailable`, `Aborted`, ...) after the
/// prior state has been kept.
#[instrument(skip_all, fields(slot = %session.slot_id()))]
pub async fn handle_run_turn(
    session: &Session,
    input: &str,
    ctx: &TurnContext<'_>,
) -> Result<TurnReport, DomainError> {
    let mut state = session.begin_turn()?;
    let base = state.game.clone();
    execute_turn(session, &mut state, base, input, ctx).await
}

/// Re-runs the last committed turn with its original input: the pre-turn
/// state is restored, that turn's log rows are purged, and the turn runs
/// again. If the rerun fails the committed turn stays in place.
///
/// # Errors
///
/// Returns `DomainError::Validation` if there is no committed turn to
/// reroll, plus every error of [`handle_run_turn`].
#[instrument(skip_all, fields(slot = %session.slot_id()))]
pub async fn handle_reroll(
    session: &Session,
    ctx: &TurnContext<'_>,
) -> Result<TurnReport, DomainError> {
    let mut state = session.begin_turn()?;
    let checkpoint = state
        .checkpoint
        .clone()
        .ok_or_else(|| DomainError::Validation("no committed turn to reroll".to_owned()))?;
    let mut base = checkpoint.before;
    let purged = purge_turn(&mut base, checkpoint.turn);
    info!(turn = checkpoint.turn, purged, "rerolling turn");
    execute_turn(session, &mut state, base, &checkpoint.input, ctx).await
}

/// Restores the state from before the last committed turn without running
/// anything, persists it, and returns the turn the session is back at.
///
/// # Errors
///
/// Returns `DomainError::TurnInProgress` while a turn runs, or
/// `DomainError::Validation` if there is nothing to rewind.
#[instrument(skip_all, fields(slot = %session.slot_id()))]
pub async fn handle_rewind(session: &Session, ctx: &TurnContext<'_>) -> Result<u32, DomainError> {
    let mut state = session.begin_turn()?;
    let checkpoint = state.restore_checkpoint()?;
    info!(from = checkpoint.turn, to = state.game.turn, "turn rewound");
    persist(session.slot_id(), &state.game, ctx).await;
    Ok(state.game.turn)
}
