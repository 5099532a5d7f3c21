//! Screening of a service's commands before they reach the applier.

use tavern_core::command::{Command, ServiceKey};
use tracing::{instrument, warn};

use crate::domain::guard::{GuardOutcome, guard_commands};
use crate::domain::scope::StrictAllowlist;

/// Runs the ownership guard over one service's commands and logs every
/// rejection. `allowlist` is only consulted in strict mode.
#[instrument(skip(commands, allowlist), fields(service = %service, count = commands.len()))]
pub fn screen_service_commands(
    service: ServiceKey,
    commands: Vec<Command>,
    allowlist: Option<&StrictAllowlist>,
) -> GuardOutcome {
    let outcome = guard_commands(service, commands, allowlist);
    for reject in &outcome.rejected {
        warn!(
            reason = %reject.reason,
            action = %reject.action,
            sheet = reject.sheet.as_deref().unwrap_or("-"),
            field = reject.field.as_deref().unwrap_or("-"),
            "command rejected by service guard"
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tavern_core::command::Action;

    use crate::domain::guard::GuardReason;

    #[test]
    fn test_screening_passes_state_commands_without_allowlist() {
        // Arrange
        let commands = vec![
            Command::at_path(Action::Add, "character.currency", json!(-10), ServiceKey::State),
            Command::new(
                Action::UpsertCharacter,
                json!({ "npc_id": "NPC_1", "name": "Aiz" }),
                ServiceKey::State,
            ),
        ];

        // Act
        let outcome = screen_service_commands(ServiceKey::State, commands, None);

        // Assert
        assert_eq!(outcome.commands.len(), 2);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_screening_reports_memory_overreach() {
        let commands = vec![Command::new(
            Action::ApplyEconDelta,
            json!({ "delta": 5 }),
            ServiceKey::Memory,
        )];

        let outcome = screen_service_commands(ServiceKey::Memory, commands, None);

        assert!(outcome.commands.is_empty());
        assert_eq!(outcome.rejected[0].reason, GuardReason::NotSupportedAction);
    }
}
