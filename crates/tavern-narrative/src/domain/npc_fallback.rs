//! NPC fallback.
//!
//! Every character who speaks in the turn's narrative must end up in the
//! registry. When the state service forgets one, the fallback registers it
//! and logs its latest line as a dialogue interaction.

use std::collections::BTreeSet;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tavern_commands::domain::payloads::{payload_rows, sheet_upserts};
use tavern_core::command::{Action, Command, ServiceKey};
use tavern_core::sheet::SheetId;
use tavern_rules::domain::scope::StrictAllowlist;
use tavern_world_state::domain::state::GameState;

use super::fallback::FallbackReason;
use super::payload::TurnPayload;

/// Source stamped on synthesized interaction rows.
pub const NPC_FALLBACK_SOURCE: &str = "state-fallback:narrative-npc";

const NARRATION_SPEAKERS: &[&str] = &["旁白", "系统", "战斗结算", "narrator", "system"];

const SUMMARY_MAX_CHARS: usize = 120;

/// Result of the NPC fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct NpcFallback {
    /// Reason class.
    pub reason: FallbackReason,
    /// Observability marker, when applied.
    pub marker: Option<String>,
    /// Synthesized commands, in append order.
    pub commands: Vec<Command>,
    /// Registry rows synthesized.
    pub created_npcs: usize,
    /// Interaction rows synthesized.
    pub created_interactions: usize,
}

impl NpcFallback {
    fn skipped(reason: FallbackReason) -> Self {
        Self {
            reason,
            marker: None,
            commands: Vec::new(),
            created_npcs: 0,
            created_interactions: 0,
        }
    }
}

/// Stable id for an unregistered speaker: `NPC_AUTO_` plus the first eight
/// hex digits of the SHA-256 of the trimmed name.
#[must_use]
pub fn stable_npc_id(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return "NPC_AUTO_UNKNOWN".to_owned();
    }
    let digest = Sha256::digest(name.as_bytes());
    let tag: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("NPC_AUTO_{tag}")
}

fn is_narration(speaker: &str, player_name: &str) -> bool {
    let speaker = speaker.trim();
    speaker.is_empty()
        || (!player_name.is_empty() && speaker == player_name)
        || NARRATION_SPEAKERS.contains(&speaker)
        || NARRATION_SPEAKERS.contains(&speaker.to_lowercase().as_str())
}

fn field_text(row: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match row.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn cover_row(
    covered: &mut BTreeSet<String>,
    state: &GameState,
    row: &Map<String, Value>,
    name_fields: &[&str],
    id_fields: &[&str],
) {
    if let Some(name) = field_text(row, name_fields) {
        covered.insert(name);
    }
    if let Some(name) = field_text(row, id_fields).and_then(|id| state.npc_name_by_id(&id)) {
        covered.insert(name.to_owned());
    }
}

/// Names of characters the batch already registers or logs.
#[must_use]
pub fn covered_speakers(commands: &[Command], state: &GameState) -> BTreeSet<String> {
    let mut covered = BTreeSet::new();
    for command in commands {
        match command.action {
            Action::UpsertCharacter => {
                for row in payload_rows(&command.action, &command.value).unwrap_or_default() {
                    cover_row(
                        &mut covered,
                        state,
                        &row,
                        &["name", "姓名", "npc_name", "NPC"],
                        &["npc_id", "id", "NPC_ID"],
                    );
                }
            }
            Action::UpsertSheetRows => {
                for upsert in sheet_upserts(&command.action, &command.value).unwrap_or_default() {
                    if !matches!(
                        upsert.sheet_id,
                        SheetId::NpcRegistry | SheetId::NpcInteractionLog
                    ) {
                        continue;
                    }
                    for row in &upsert.rows {
                        cover_row(
                            &mut covered,
                            state,
                            row,
                            &["name", "姓名", "npc_name"],
                            &["npc_id", "NPC_ID"],
                        );
                    }
                }
            }
            _ => {}
        }
    }
    covered
}

/// Collapses whitespace and truncates to the summary length.
fn summarize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > SUMMARY_MAX_CHARS {
        let head: String = collapsed.chars().take(SUMMARY_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        collapsed
    }
}

/// Synthesizes registry and interaction rows for speakers the batch does
/// not cover. `allowlist` is passed only in strict mode.
#[must_use]
pub fn synthesize_npc_fallback(
    input: &str,
    commands: &[Command],
    state: &GameState,
    allowlist: Option<&StrictAllowlist>,
) -> NpcFallback {
    let Some(payload) = TurnPayload::parse(input) else {
        return NpcFallback::skipped(FallbackReason::NonStructuredInput);
    };
    let scope = payload.declared_scope();
    let registry_access = scope.covers(&SheetId::NpcRegistry);
    let log_access = scope.covers(&SheetId::NpcInteractionLog);
    if !registry_access && !log_access {
        return NpcFallback::skipped(FallbackReason::NoAccess);
    }
    if let Some(list) = allowlist {
        let registry_ok =
            !registry_access || list.has_any_field(&SheetId::NpcRegistry, &["NPC_ID", "npc_id"]);
        let log_ok =
            !log_access || list.has_any_field(&SheetId::NpcInteractionLog, &["interaction_id"]);
        if !registry_ok && !log_ok {
            return NpcFallback::skipped(FallbackReason::OutOfScope);
        }
    }

    let lines = payload.narrative_lines();
    if lines.is_empty() {
        return NpcFallback::skipped(FallbackReason::NoDialogue);
    }
    let player_name = state.character.name.trim();
    let mut latest: Vec<(String, String)> = Vec::new();
    for line in lines {
        if is_narration(&line.speaker, player_name) {
            continue;
        }
        match latest.iter_mut().find(|(speaker, _)| *speaker == line.speaker) {
            Some(entry) => entry.1 = line.text,
            None => latest.push((line.speaker, line.text)),
        }
    }
    if latest.is_empty() {
        return NpcFallback::skipped(FallbackReason::NoDialogue);
    }

    let covered = covered_speakers(commands, state);
    let game_time = payload.game_time.clone().unwrap_or_else(|| state.game_time.clone());
    let location = payload.location.clone().unwrap_or_else(|| state.location.clone());
    let turn = payload.turn.unwrap_or(state.turn).max(1);

    let mut npc_rows = Vec::new();
    let mut interaction_rows = Vec::new();
    for (index, (speaker, line)) in latest.iter().enumerate() {
        if covered.contains(speaker) {
            continue;
        }
        let summary = summarize(&format!("{speaker}: {line}"));
        if summary.is_empty() {
            continue;
        }
        let npc_id = state
            .npc_id_by_name(speaker)
            .map_or_else(|| stable_npc_id(speaker), str::to_owned);
        if registry_access {
            let mut row = json!({
                "npc_id": npc_id,
                "name": speaker,
                "status": "present",
                "present": true,
            });
            if !location.is_empty() {
                row["location"] = Value::String(location.clone());
            }
            npc_rows.push(row);
        }
        if log_access {
            interaction_rows.push(json!({
                "interaction_id": format!("{npc_id}_auto_{turn}_{}", index + 1),
                "npc_id": npc_id,
                "npc_name": speaker,
                "timestamp": game_time,
                "type": "dialogue",
                "summary": summary,
                "source": NPC_FALLBACK_SOURCE,
            }));
        }
    }

    if npc_rows.is_empty() && interaction_rows.is_empty() {
        return NpcFallback::skipped(FallbackReason::AlreadyCovered);
    }
    let created_npcs = npc_rows.len();
    let created_interactions = interaction_rows.len();
    let mut synthesized = Vec::new();
    if created_npcs > 0 {
        synthesized.push(Command::new(
            Action::UpsertCharacter,
            Value::Array(npc_rows),
            ServiceKey::State,
        ));
    }
    if created_interactions > 0 {
        synthesized.push(Command::new(
            Action::UpsertSheetRows,
            json!({
                "sheetId": SheetId::NpcInteractionLog.as_str(),
                "keyField": SheetId::NpcInteractionLog.default_key_field(),
                "rows": interaction_rows,
            }),
            ServiceKey::State,
        ));
    }
    NpcFallback {
        reason: FallbackReason::Applied,
        marker: Some(format!(
            "npc-fallback(npc={created_npcs},interaction={created_interactions})"
        )),
        commands: synthesized,
        created_npcs,
        created_interactions,
    }
}
