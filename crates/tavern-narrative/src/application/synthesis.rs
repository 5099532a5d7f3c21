//! Fallback synthesis for one state-service response.

use serde::Serialize;
use tavern_core::command::Command;
use tavern_rules::domain::scope::StrictAllowlist;
use tavern_world_state::domain::state::GameState;
use tracing::{debug, info, instrument};

use crate::domain::econ_fallback::synthesize_econ_fallback;
use crate::domain::fallback::FallbackReason;
use crate::domain::npc_fallback::synthesize_npc_fallback;

/// What the fallbacks decided for one response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisReport {
    /// Economic fallback reason class.
    pub econ_reason: FallbackReason,
    /// Net delta the economic fallback booked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub econ_delta: Option<f64>,
    /// NPC fallback reason class.
    pub npc_reason: FallbackReason,
    /// Registry rows synthesized.
    pub created_npcs: usize,
    /// Interaction rows synthesized.
    pub created_interactions: usize,
    /// Markers of the fallbacks that applied.
    pub markers: Vec<String>,
}

/// Runs the economic fallback, then the NPC fallback over the augmented
/// batch, and appends whatever they synthesize after the service's own
/// commands.
#[instrument(skip_all, fields(commands = commands.len()))]
pub fn synthesize_fallbacks(
    input: &str,
    mut commands: Vec<Command>,
    state: &GameState,
    allowlist: Option<&StrictAllowlist>,
) -> (Vec<Command>, SynthesisReport) {
    let econ = synthesize_econ_fallback(input, &commands, allowlist);
    debug!(reason = %econ.reason, "economic fallback evaluated");
    let mut markers = Vec::new();
    if let Some(command) = econ.command {
        commands.push(command);
    }
    markers.extend(econ.marker);

    let npc = synthesize_npc_fallback(input, &commands, state, allowlist);
    debug!(reason = %npc.reason, "npc fallback evaluated");
    commands.extend(npc.commands);
    markers.extend(npc.marker);

    if !markers.is_empty() {
        info!(markers = %markers.join(", "), "fallback commands synthesized");
    }
    let report = SynthesisReport {
        econ_reason: econ.reason,
        econ_delta: econ.delta,
        npc_reason: npc.reason,
        created_npcs: npc.created_npcs,
        created_interactions: npc.created_interactions,
        markers,
    };
    (commands, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tavern_core::command::Action;

    #[test]
    fn test_both_fallbacks_append_after_service_commands() {
        // Arrange
        let input = json!({
            "叙事": [
                { "sender": "Lili", "text": "That will be 三百法利, paid up front." },
            ],
            "回合数": 2
        })
        .to_string();
        let service_commands = vec![Command::at_path(
            Action::Set,
            "weather",
            json!("rain"),
            tavern_core::command::ServiceKey::State,
        )];

        // Act
        let (commands, report) =
            synthesize_fallbacks(&input, service_commands, &GameState::default(), None);

        // Assert
        let actions: Vec<&Action> = commands.iter().map(|c| &c.action).collect();
        assert_eq!(
            actions,
            vec![
                &Action::Set,
                &Action::ApplyEconDelta,
                &Action::UpsertCharacter,
                &Action::UpsertSheetRows,
            ]
        );
        assert_eq!(report.econ_reason, FallbackReason::Applied);
        assert_eq!(report.econ_delta, Some(-300.0));
        assert_eq!(report.npc_reason, FallbackReason::Applied);
        assert_eq!(report.markers.len(), 2);
    }

    #[test]
    fn test_plain_text_input_synthesizes_nothing() {
        let (commands, report) =
            synthesize_fallbacks("just prose", Vec::new(), &GameState::default(), None);

        assert!(commands.is_empty());
        assert_eq!(report.econ_reason, FallbackReason::NonStructuredInput);
        assert_eq!(report.npc_reason, FallbackReason::NonStructuredInput);
        assert!(report.markers.is_empty());
    }
}
