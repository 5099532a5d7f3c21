//! Service orchestration: sends a turn's input to one generation service
//! and turns its response into commands ready for the applier.

use serde_json::Value;
use tavern_commands::application::extraction::response_commands;
use tavern_commands::domain::normalizer::normalize_batch;
use tavern_core::command::{Command, ServiceKey};
use tavern_core::error::DomainError;
use tavern_core::service::{GenerationService, ServiceSettings};
use tavern_memory::application::fill::{FillRequest, MemoryFillConfig, fill_memory};
use tavern_narrative::application::synthesis::{SynthesisReport, synthesize_fallbacks};
use tavern_rules::application::screening::screen_service_commands;
use tavern_rules::domain::guard::GuardReject;
use tavern_rules::domain::scope::StrictAllowlist;
use tavern_world_state::domain::state::GameState;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::turn::{DroppedCommand, MemoryReport};

/// What every dispatch of a turn shares.
#[derive(Clone, Copy)]
pub struct DispatchContext<'a> {
    /// The generation collaborator.
    pub service: &'a dyn GenerationService,
    /// Serialized state handed to the service.
    pub snapshot: &'a Value,
    /// Per-invocation settings.
    pub settings: &'a ServiceSettings,
    /// Allowlist to enforce, in strict mode.
    pub allowlist: Option<&'a StrictAllowlist>,
    /// How the memory service fills the log.
    pub memory: &'a MemoryFillConfig,
    /// The turn's cancellation token.
    pub cancel: &'a CancellationToken,
}

/// Commands produced by one dispatch, plus what was dropped on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    /// Service the key routed to.
    pub service: ServiceKey,
    /// Commands to apply, fallbacks last.
    pub commands: Vec<Command>,
    /// Raw entries the normalizer dropped.
    pub malformed: Vec<DroppedCommand>,
    /// Commands the guard dropped.
    pub guard_rejections: Vec<GuardReject>,
    /// Fallback decisions, for the state service.
    pub synthesis: Option<SynthesisReport>,
    /// Memory fill counters, for the memory service.
    pub memory: Option<MemoryReport>,
    /// Extraction repair note.
    pub repair_note: Option<String>,
}

impl Dispatched {
    fn empty(service: ServiceKey) -> Self {
        Self {
            service,
            commands: Vec::new(),
            malformed: Vec::new(),
            guard_rejections: Vec::new(),
            synthesis: None,
            memory: None,
            repair_note: None,
        }
    }
}

async fn invoke_and_screen(
    service: ServiceKey,
    input: &str,
    ctx: &DispatchContext<'_>,
) -> Result<Dispatched, DomainError> {
    let response = ctx
        .service
        .invoke(service, input, ctx.snapshot, ctx.settings, ctx.cancel)
        .await?;
    let mut dispatched = Dispatched::empty(service);
    let raw = match response_commands(&response) {
        Ok((raw, note)) => {
            dispatched.repair_note = note;
            raw
        }
        Err(error) => {
            warn!(service = %service, error = %error, "service response had no commands");
            return Ok(dispatched);
        }
    };

    let batch = normalize_batch(&raw, service);
    for malformed in &batch.malformed {
        warn!(
            service = %service,
            index = malformed.index,
            error = %malformed.error,
            "malformed command dropped"
        );
    }
    dispatched.malformed = batch.malformed.iter().map(DroppedCommand::from).collect();
    let screened = screen_service_commands(service, batch.commands, ctx.allowlist);
    dispatched.commands = screened.commands;
    dispatched.guard_rejections = screened.rejected;
    Ok(dispatched)
}

async fn dispatch_state(
    input: &str,
    state: &GameState,
    ctx: &DispatchContext<'_>,
) -> Result<Dispatched, DomainError> {
    let mut dispatched = invoke_and_screen(ServiceKey::State, input, ctx).await?;
    let (commands, report) = synthesize_fallbacks(
        input,
        std::mem::take(&mut dispatched.commands),
        state,
        ctx.allowlist,
    );
    dispatched.commands = commands;
    dispatched.synthesis = Some(report);
    Ok(dispatched)
}

async fn dispatch_memory(
    input: &str,
    state: &GameState,
    ctx: &DispatchContext<'_>,
) -> Result<Dispatched, DomainError> {
    let request = FillRequest {
        input,
        snapshot: ctx.snapshot,
        settings: ctx.settings,
        turn: state.turn,
    };
    let mut outcome = fill_memory(ctx.service, request, ctx.memory, ctx.cancel).await?;
    let mut report = MemoryReport::default();
    report.absorb(&outcome);
    let mut dispatched = Dispatched::empty(ServiceKey::Memory);
    dispatched.repair_note = outcome.repair_note();
    dispatched.commands = std::mem::take(&mut outcome.commands);
    dispatched.memory = Some(report);
    Ok(dispatched)
}

/// Routes a raw service key to exactly one handler and runs it. Unknown
/// keys go to the state service. The state handler appends fallback
/// commands after the service's own; the memory handler fills the log in
/// the configured mode.
///
/// # Errors
///
/// Propagates service failures, including `DomainError::Aborted` on
/// cancellation. Unusable responses yield an empty dispatch instead.
#[instrument(skip_all, fields(service = %ServiceKey::route(raw_key), turn = state.turn))]
pub async fn dispatch(
    raw_key: &str,
    input: &str,
    state: &GameState,
    ctx: &DispatchContext<'_>,
) -> Result<Dispatched, DomainError> {
    let service = ServiceKey::route(raw_key);
    let dispatched = match service {
        ServiceKey::State => dispatch_state(input, state, ctx).await?,
        ServiceKey::Memory => dispatch_memory(input, state, ctx).await?,
        ServiceKey::Narrative | ServiceKey::Map | ServiceKey::Phone => {
            invoke_and_screen(service, input, ctx).await?
        }
    };
    info!(
        commands = dispatched.commands.len(),
        malformed = dispatched.malformed.len(),
        guarded = dispatched.guard_rejections.len(),
        "service dispatched"
    );
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tavern_core::command::Action;
    use tavern_core::service::ServiceResponse;
    use tavern_narrative::domain::fallback::FallbackReason;
    use tavern_test_support::{ScriptedGenerationService, sample_state, turn_input};

    static NULL_SNAPSHOT: Value = Value::Null;

    fn context<'a>(
        service: &'a ScriptedGenerationService,
        settings: &'a ServiceSettings,
        memory: &'a MemoryFillConfig,
        cancel: &'a CancellationToken,
    ) -> DispatchContext<'a> {
        DispatchContext {
            service,
            snapshot: &NULL_SNAPSHOT,
            settings,
            allowlist: None,
            memory,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_unknown_key_routes_to_the_state_service() {
        // Arrange
        let service = ScriptedGenerationService::new().with_commands(
            ServiceKey::State,
            vec![json!({ "action": "set", "key": "weather", "value": "rain" })],
        );
        let (settings, memory, cancel) = (
            ServiceSettings::default(),
            MemoryFillConfig::default(),
            CancellationToken::new(),
        );
        let ctx = context(&service, &settings, &memory, &cancel);
        let input = turn_input(4, &[("旁白", "Rain falls on Orario.")], Value::Null);

        // Act
        let dispatched = dispatch("weather-bot", &input, &sample_state(), &ctx)
            .await
            .unwrap();

        // Assert
        assert_eq!(dispatched.service, ServiceKey::State);
        assert_eq!(service.calls_to(ServiceKey::State).len(), 1);
        assert_eq!(dispatched.commands.len(), 1);
        let synthesis = dispatched.synthesis.unwrap();
        assert_eq!(synthesis.econ_reason, FallbackReason::NoDelta);
    }

    #[tokio::test]
    async fn test_state_dispatch_appends_the_economic_fallback() {
        // Arrange
        let service = ScriptedGenerationService::new().with_commands(
            ServiceKey::State,
            vec![json!({ "action": "set", "key": "weather", "value": "rain" })],
        );
        let (settings, memory, cancel) = (
            ServiceSettings::default(),
            MemoryFillConfig::default(),
            CancellationToken::new(),
        );
        let ctx = context(&service, &settings, &memory, &cancel);
        let line = ("旁白", "Bell paid 120 valis for a potion.");
        let input = turn_input(4, &[line], Value::Null);

        // Act
        let dispatched = dispatch("state", &input, &sample_state(), &ctx).await.unwrap();

        // Assert
        assert_eq!(dispatched.commands.len(), 2);
        assert_eq!(dispatched.commands[0].action, Action::Set);
        assert!(dispatched.commands[1].action.is_economic());
        let synthesis = dispatched.synthesis.unwrap();
        assert_eq!(synthesis.econ_reason, FallbackReason::Applied);
    }

    #[tokio::test]
    async fn test_raw_text_responses_are_extracted_and_screened() {
        // Arrange
        let raw = r#"```json
{"tavern_commands": [
  {"action": "set", "key": "location", "value": "Babel"},
  {"action": "append_log_summary", "value": {"summary": "x"}},
  {"action": "set"},
]}
```"#;
        let service = ScriptedGenerationService::new().with_raw_text(ServiceKey::State, raw);
        let (settings, memory, cancel) = (
            ServiceSettings::default(),
            MemoryFillConfig::default(),
            CancellationToken::new(),
        );
        let ctx = context(&service, &settings, &memory, &cancel);

        // Act
        let dispatched = dispatch("state", "{}", &sample_state(), &ctx).await.unwrap();

        // Assert
        assert_eq!(dispatched.malformed.len(), 1);
        assert_eq!(dispatched.guard_rejections.len(), 1);
        assert_eq!(dispatched.commands.len(), 1);
        assert!(dispatched.repair_note.is_some());
    }

    #[tokio::test]
    async fn test_memory_dispatch_fills_the_log() {
        // Arrange
        let service = ScriptedGenerationService::new().with_commands(
            ServiceKey::Memory,
            vec![
                json!({ "action": "append_log_summary", "value": { "summary": "Met Lili." } }),
                json!({ "action": "append_log_outline", "value": { "outline": "Meeting" } }),
            ],
        );
        let (settings, memory, cancel) = (
            ServiceSettings::default(),
            MemoryFillConfig::default(),
            CancellationToken::new(),
        );
        let ctx = context(&service, &settings, &memory, &cancel);

        // Act
        let dispatched = dispatch("memory", "{}", &sample_state(), &ctx).await.unwrap();

        // Assert
        assert_eq!(dispatched.service, ServiceKey::Memory);
        assert_eq!(dispatched.commands.len(), 2);
        assert!(dispatched.synthesis.is_none());
        assert_eq!(dispatched.memory.unwrap().requests, 1);
    }

    #[tokio::test]
    async fn test_service_failure_propagates() {
        let service = ScriptedGenerationService::new().with_reply(
            ServiceKey::Map,
            Err(DomainError::ServiceUnavailable("HTTP 503".to_owned())),
        );
        let (settings, memory, cancel) = (
            ServiceSettings::default(),
            MemoryFillConfig::default(),
            CancellationToken::new(),
        );
        let ctx = context(&service, &settings, &memory, &cancel);

        let result = dispatch("map", "{}", &sample_state(), &ctx).await;

        assert!(matches!(result, Err(DomainError::ServiceUnavailable(_))));
    }

    #[tokio::test]
    async fn test_empty_response_yields_an_empty_dispatch() {
        let service = ScriptedGenerationService::new().with_reply(
            ServiceKey::Map,
            Ok(ServiceResponse {
                raw_text: "no commands today".to_owned(),
                ..ServiceResponse::default()
            }),
        );
        let (settings, memory, cancel) = (
            ServiceSettings::default(),
            MemoryFillConfig::default(),
            CancellationToken::new(),
        );
        let ctx = context(&service, &settings, &memory, &cancel);

        let dispatched = dispatch("map", "{}", &sample_state(), &ctx).await.unwrap();

        assert!(dispatched.commands.is_empty());
        assert!(dispatched.malformed.is_empty());
    }
}
