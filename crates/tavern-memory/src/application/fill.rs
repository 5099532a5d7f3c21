//! Memory fill bridge.
//!
//! Asks the memory service for the turn's summary and outline rows, either
//! in one combined request or fanned out per target sheet, and hands back
//! deduplicated commands ready for the applier.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tavern_commands::application::extraction::response_commands;
use tavern_commands::domain::normalizer::normalize_batch;
use tavern_core::command::{Action, Command, ServiceKey};
use tavern_core::error::DomainError;
use tavern_core::service::{FillMode, FillTask, GenerationService, ServiceSettings};
use tavern_core::sheet::SheetId;
use tavern_rules::application::screening::screen_service_commands;
use tavern_rules::domain::scope::{DeclaredScope, ScopePolicy};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::pairing::{PairingIssue, dedupe_log_commands};

/// Input key carrying the fill task.
pub const FILL_TASK_KEY: &str = "填表任务";

/// Input key listing the turns a repair request should rewrite.
pub const REPAIR_TURNS_KEY: &str = "repairTurns";

/// How the memory service is asked to fill the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemoryFillConfig {
    /// Combined or per-sheet requests.
    pub mode: FillMode,
    /// Per-sheet requests in flight at once.
    pub max_concurrent_sheets: usize,
    /// Sheets the memory service fills.
    pub target_sheets: Vec<SheetId>,
}

impl Default for MemoryFillConfig {
    fn default() -> Self {
        Self {
            mode: FillMode::Single,
            max_concurrent_sheets: 2,
            target_sheets: vec![SheetId::LogSummary, SheetId::LogOutline],
        }
    }
}

/// What every fill request of a turn shares.
#[derive(Debug, Clone, Copy)]
pub struct FillRequest<'a> {
    /// Base service input for the turn.
    pub input: &'a str,
    /// Serialized state handed to the service.
    pub snapshot: &'a Value,
    /// Per-invocation settings.
    pub settings: &'a ServiceSettings,
    /// Turn rows belong to when they do not say.
    pub turn: u32,
}

/// Commands gathered from one or more memory requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFillOutcome {
    /// Deduplicated commands, ready to apply.
    pub commands: Vec<Command>,
    /// Requests issued.
    pub requests: usize,
    /// Raw entries that could not be normalized.
    pub malformed: usize,
    /// Commands dropped by the ownership guard.
    pub guarded: usize,
    /// Commands dropped for writing outside their request's target sheet.
    pub out_of_scope: usize,
    /// Duplicate rows collapsed.
    pub deduplicated: usize,
    /// Repair notes of the responses, in request order.
    pub repair_notes: Vec<String>,
}

impl MemoryFillOutcome {
    fn absorb(&mut self, other: MemoryFillOutcome) {
        self.commands.extend(other.commands);
        self.requests += other.requests;
        self.malformed += other.malformed;
        self.guarded += other.guarded;
        self.out_of_scope += other.out_of_scope;
        self.repair_notes.extend(other.repair_notes);
    }

    fn deduplicate(mut self, turn: u32) -> Self {
        let deduped = dedupe_log_commands(std::mem::take(&mut self.commands), turn);
        self.commands = deduped.commands;
        self.deduplicated += deduped.dropped;
        self
    }

    /// Repair notes joined into one line.
    #[must_use]
    pub fn repair_note(&self) -> Option<String> {
        (!self.repair_notes.is_empty()).then(|| self.repair_notes.join(" | "))
    }
}

/// Attaches a fill task, and optionally the turns to repair, to a service
/// input. Inputs that are not JSON objects are wrapped as narrative.
#[must_use]
pub fn fill_input(input: &str, task: &FillTask, repair_turns: &[u32]) -> String {
    let mut document = match serde_json::from_str::<Value>(input.trim()) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("叙事".to_owned(), Value::String(input.to_owned()));
            map
        }
    };
    document.insert(
        FILL_TASK_KEY.to_owned(),
        serde_json::to_value(task).unwrap_or(Value::Null),
    );
    if !repair_turns.is_empty() {
        document.insert(REPAIR_TURNS_KEY.to_owned(), Value::from(repair_turns.to_vec()));
    }
    Value::Object(document).to_string()
}

fn target_sheet(command: &Command) -> Option<SheetId> {
    match command.action {
        Action::AppendLogSummary => Some(SheetId::LogSummary),
        Action::AppendLogOutline => Some(SheetId::LogOutline),
        _ => command.payload_sheet().map(SheetId::parse),
    }
}

async fn request_fill(
    service: &dyn GenerationService,
    request: FillRequest<'_>,
    task: FillTask,
    repair_turns: &[u32],
    cancel: &CancellationToken,
) -> Result<MemoryFillOutcome, DomainError> {
    let input = fill_input(request.input, &task, repair_turns);
    let response = service
        .invoke(
            ServiceKey::Memory,
            &input,
            request.snapshot,
            request.settings,
            cancel,
        )
        .await?;

    let mut outcome = MemoryFillOutcome {
        requests: 1,
        ..MemoryFillOutcome::default()
    };
    let (raw, note) = match response_commands(&response) {
        Ok(extracted) => extracted,
        Err(error) => {
            warn!(error = %error, target = ?task.target_sheet, "memory response had no commands");
            return Ok(outcome);
        }
    };
    outcome.repair_notes.extend(note);

    let batch = normalize_batch(&raw, ServiceKey::Memory);
    outcome.malformed = batch.malformed.len();
    let screened = screen_service_commands(ServiceKey::Memory, batch.commands, None);
    outcome.guarded = screened.rejected.len();

    let scope = ScopePolicy::new(DeclaredScope::from_task(Some(&task)), None);
    for command in screened.commands {
        match target_sheet(&command) {
            Some(sheet) if scope.is_allowed(&sheet, None) => outcome.commands.push(command),
            sheet => {
                warn!(
                    action = %command.action,
                    sheet = ?sheet,
                    target = ?task.target_sheet,
                    reason = "out-of-scope",
                    "memory command dropped"
                );
                outcome.out_of_scope += 1;
            }
        }
    }
    Ok(outcome)
}

async fn fan_out(
    service: &dyn GenerationService,
    request: FillRequest<'_>,
    sheets: &[SheetId],
    max_concurrent: usize,
    repair_turns: &[u32],
    cancel: &CancellationToken,
) -> Result<MemoryFillOutcome, DomainError> {
    let limit = max_concurrent.max(1);
    let mut outcome = MemoryFillOutcome::default();
    for chunk in sheets.chunks(limit) {
        let requests = chunk.iter().map(|sheet| {
            let task = FillTask::targeted(sheet.clone(), limit);
            request_fill(service, request, task, repair_turns, cancel)
        });
        for result in join_all(requests).await {
            outcome.absorb(result?);
        }
    }
    Ok(outcome)
}

/// Requests the turn's memory rows.
///
/// # Errors
///
/// Propagates service failures, including `DomainError::Aborted` when the
/// turn is cancelled. Responses without commands are not errors.
#[instrument(skip_all, fields(turn = request.turn, mode = ?config.mode))]
pub async fn fill_memory(
    service: &dyn GenerationService,
    request: FillRequest<'_>,
    config: &MemoryFillConfig,
    cancel: &CancellationToken,
) -> Result<MemoryFillOutcome, DomainError> {
    let outcome = match config.mode {
        FillMode::Single => {
            let task = FillTask::single(config.target_sheets.clone());
            request_fill(service, request, task, &[], cancel).await?
        }
        FillMode::AsyncBatch => {
            fan_out(
                service,
                request,
                &config.target_sheets,
                config.max_concurrent_sheets,
                &[],
                cancel,
            )
            .await?
        }
    }
    .deduplicate(request.turn);
    info!(
        requests = outcome.requests,
        commands = outcome.commands.len(),
        deduplicated = outcome.deduplicated,
        "memory fill collected"
    );
    Ok(outcome)
}

/// Requests only the rows missing from broken pairs: one targeted request
/// per missing sheet, listing the affected turns.
///
/// # Errors
///
/// Propagates service failures.
#[instrument(skip_all, fields(issues = issues.len()))]
pub async fn request_pairing_repair(
    service: &dyn GenerationService,
    request: FillRequest<'_>,
    issues: &[PairingIssue],
    config: &MemoryFillConfig,
    cancel: &CancellationToken,
) -> Result<MemoryFillOutcome, DomainError> {
    let mut sheets: Vec<SheetId> = Vec::new();
    let mut turns: Vec<u32> = Vec::new();
    for issue in issues {
        if let Some(sheet) = issue.missing_sheet() {
            if !sheets.contains(&sheet) {
                sheets.push(sheet);
            }
            if !turns.contains(&issue.turn) {
                turns.push(issue.turn);
            }
        }
    }
    if sheets.is_empty() {
        return Ok(MemoryFillOutcome::default());
    }
    info!(sheets = ?sheets, turns = ?turns, "requesting targeted pairing repair");
    let outcome = fan_out(
        service,
        request,
        &sheets,
        config.max_concurrent_sheets,
        &turns,
        cancel,
    )
    .await?;
    Ok(outcome.deduplicate(request.turn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tavern_core::service::ServiceResponse;
    use tavern_test_support::{ScriptedGenerationService, turn_input};

    use crate::domain::pairing::PairingIssueKind;

    fn request<'a>(
        input: &'a str,
        snapshot: &'a Value,
        settings: &'a ServiceSettings,
    ) -> FillRequest<'a> {
        FillRequest {
            input,
            snapshot,
            settings,
            turn: 4,
        }
    }

    fn summary_command(text: &str) -> Value {
        json!({ "action": "append_log_summary", "value": { "summary": text } })
    }

    fn outline_command(text: &str) -> Value {
        json!({ "action": "append_log_outline", "value": { "outline": text } })
    }

    #[test]
    fn test_fill_input_attaches_the_task() {
        // Arrange
        let input = turn_input(4, &[("Lili", "Hello")], Value::Null);

        // Act
        let filled = fill_input(&input, &FillTask::targeted(SheetId::LogOutline, 2), &[4]);

        // Assert
        let document: Value = serde_json::from_str(&filled).unwrap();
        assert_eq!(document[FILL_TASK_KEY]["targetSheet"], json!("LOG_Outline"));
        assert_eq!(document[REPAIR_TURNS_KEY], json!([4]));
        assert_eq!(document["回合数"], json!(4));
    }

    #[test]
    fn test_fill_input_wraps_plain_text() {
        let filled = fill_input("The tavern is quiet.", &FillTask::default(), &[]);

        let document: Value = serde_json::from_str(&filled).unwrap();
        assert_eq!(document["叙事"], json!("The tavern is quiet."));
        assert!(document.get(REPAIR_TURNS_KEY).is_none());
    }

    #[tokio::test]
    async fn test_single_mode_issues_one_request_and_dedupes() {
        // Arrange
        let service = ScriptedGenerationService::new().with_commands(
            ServiceKey::Memory,
            vec![
                summary_command("draft"),
                summary_command("final"),
                outline_command("arc"),
                json!({ "action": "apply_econ_delta", "value": { "delta": 5 } }),
            ],
        );
        let snapshot = json!({});
        let settings = ServiceSettings::default();

        // Act
        let outcome = fill_memory(
            &service,
            request("{}", &snapshot, &settings),
            &MemoryFillConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(service.calls_to(ServiceKey::Memory).len(), 1);
        assert_eq!(outcome.requests, 1);
        assert_eq!(outcome.guarded, 1);
        assert_eq!(outcome.deduplicated, 1);
        assert_eq!(outcome.commands.len(), 2);
        assert_eq!(outcome.commands[0].value[0]["summary"], json!("final"));
        assert_eq!(outcome.commands[0].value[0]["turn"], json!(4));
    }

    #[tokio::test]
    async fn test_async_batch_constrains_each_request_to_its_sheet() {
        // Arrange
        let service = ScriptedGenerationService::new().with_handler(ServiceKey::Memory, |input| {
            let document: Value = serde_json::from_str(input).unwrap();
            let commands = match document[FILL_TASK_KEY]["targetSheet"].as_str() {
                Some("LOG_Summary") => vec![summary_command("s"), outline_command("stray")],
                _ => vec![outline_command("o")],
            };
            Ok(ServiceResponse {
                commands,
                ..ServiceResponse::default()
            })
        });
        let config = MemoryFillConfig {
            mode: FillMode::AsyncBatch,
            max_concurrent_sheets: 1,
            ..MemoryFillConfig::default()
        };
        let snapshot = json!({});
        let settings = ServiceSettings::default();

        // Act
        let outcome = fill_memory(
            &service,
            request("{}", &snapshot, &settings),
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(outcome.requests, 2);
        assert_eq!(outcome.out_of_scope, 1);
        let actions: Vec<&Action> = outcome.commands.iter().map(|c| &c.action).collect();
        assert_eq!(actions, vec![&Action::AppendLogSummary, &Action::AppendLogOutline]);
        assert_eq!(outcome.commands[1].value[0]["outline"], json!("o"));
    }

    #[tokio::test]
    async fn test_repair_targets_only_the_missing_sheet() {
        // Arrange
        let service = ScriptedGenerationService::new()
            .with_commands(ServiceKey::Memory, vec![outline_command("repaired")]);
        let issues = vec![PairingIssue {
            turn: 3,
            kind: PairingIssueKind::MissingOutline,
        }];
        let snapshot = json!({});
        let settings = ServiceSettings::default();

        // Act
        let outcome = request_pairing_repair(
            &service,
            request("{}", &snapshot, &settings),
            &issues,
            &MemoryFillConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Assert
        let calls = service.calls_to(ServiceKey::Memory);
        assert_eq!(calls.len(), 1);
        let sent: Value = serde_json::from_str(&calls[0].input).unwrap();
        assert_eq!(sent[FILL_TASK_KEY]["targetSheet"], json!("LOG_Outline"));
        assert_eq!(sent[REPAIR_TURNS_KEY], json!([3]));
        assert_eq!(outcome.commands.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_fill_is_aborted() {
        let service = ScriptedGenerationService::new().hanging(ServiceKey::Memory);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let snapshot = json!({});
        let settings = ServiceSettings::default();

        let result = fill_memory(
            &service,
            request("{}", &snapshot, &settings),
            &MemoryFillConfig::default(),
            &cancel,
        )
        .await;

        match result {
            Err(DomainError::Aborted) => {}
            other => panic!("expected Aborted, got {other:?}"),
        }
    }
}
