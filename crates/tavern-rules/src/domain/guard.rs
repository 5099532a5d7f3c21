//! Per-service command ownership.
//!
//! The memory service owns the derived log tables, the map service owns map
//! actions, and the state service owns everything else. In strict mode the
//! guard also strips row fields the allowlist does not list.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use tavern_commands::domain::payloads::sheet_upserts;
use tavern_core::command::{Action, Command, ServiceKey};
use tavern_core::sheet::SheetId;

use super::scope::StrictAllowlist;

/// Why a command or field was rejected by the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardReason {
    /// The target belongs to the memory service.
    MemoryOwned,
    /// The service may not emit this action at all.
    NotSupportedAction,
    /// The sheet is not in the strict allowlist.
    SheetNotAllowed,
    /// The field is not in the strict allowlist.
    FieldNotAllowed,
}

impl fmt::Display for GuardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MemoryOwned => "memory_owned",
            Self::NotSupportedAction => "not_supported_action",
            Self::SheetNotAllowed => "sheet_not_allowed",
            Self::FieldNotAllowed => "field_not_allowed",
        };
        f.write_str(name)
    }
}

/// One guard rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardReject {
    /// Reason code.
    pub reason: GuardReason,
    /// Action of the rejected command.
    pub action: String,
    /// Sheet involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    /// Field involved, for field rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Commands that passed plus everything rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardOutcome {
    /// Commands allowed through, possibly with fields stripped.
    pub commands: Vec<Command>,
    /// Rejections, in encounter order.
    pub rejected: Vec<GuardReject>,
}

fn reject(reason: GuardReason, action: &Action, sheet: Option<&str>) -> GuardReject {
    GuardReject {
        reason,
        action: action.as_str().to_owned(),
        sheet: sheet.map(str::to_owned),
        field: None,
    }
}

fn is_memory_sheet(sheet: Option<&str>) -> bool {
    sheet.is_some_and(|s| SheetId::parse(s).is_memory_owned())
}

/// Filters the commands a service emitted down to what it may emit.
#[must_use]
pub fn guard_commands(
    service: ServiceKey,
    commands: Vec<Command>,
    allowlist: Option<&StrictAllowlist>,
) -> GuardOutcome {
    let mut outcome = GuardOutcome::default();
    for command in commands {
        let sheet = match command.action {
            Action::UpsertSheetRows | Action::DeleteSheetRows => {
                command.payload_sheet().map(str::to_owned)
            }
            _ => None,
        };
        let sheet = sheet.as_deref();
        match ServiceKey::route(service.as_str()) {
            ServiceKey::Memory => {
                if command.action.is_memory_log()
                    || (command.action == Action::UpsertSheetRows && is_memory_sheet(sheet))
                {
                    outcome.commands.push(command);
                } else if command.action == Action::UpsertSheetRows {
                    outcome
                        .rejected
                        .push(reject(GuardReason::MemoryOwned, &command.action, sheet));
                } else {
                    outcome.rejected.push(reject(
                        GuardReason::NotSupportedAction,
                        &command.action,
                        sheet,
                    ));
                }
            }
            ServiceKey::Map => {
                if command.action.is_map() {
                    outcome.commands.push(command);
                } else {
                    outcome.rejected.push(reject(
                        GuardReason::NotSupportedAction,
                        &command.action,
                        None,
                    ));
                }
            }
            _ => guard_state_command(command, sheet, allowlist, &mut outcome),
        }
    }
    outcome
}

fn guard_state_command(
    command: Command,
    sheet: Option<&str>,
    allowlist: Option<&StrictAllowlist>,
    outcome: &mut GuardOutcome,
) {
    if command.action.is_memory_log() {
        outcome
            .rejected
            .push(reject(GuardReason::MemoryOwned, &command.action, None));
        return;
    }
    let is_sheet_action = matches!(
        command.action,
        Action::UpsertSheetRows | Action::DeleteSheetRows
    );
    if !is_sheet_action {
        outcome.commands.push(command);
        return;
    }
    if is_memory_sheet(sheet) {
        outcome
            .rejected
            .push(reject(GuardReason::MemoryOwned, &command.action, sheet));
        return;
    }
    let Some(allowlist) = allowlist else {
        outcome.commands.push(command);
        return;
    };
    let sheet_fields = sheet.and_then(|s| allowlist.fields_for(&SheetId::parse(s)));
    if sheet_fields.as_ref().is_none_or(std::collections::BTreeSet::is_empty) {
        outcome
            .rejected
            .push(reject(GuardReason::SheetNotAllowed, &command.action, sheet));
        return;
    }
    if command.action == Action::DeleteSheetRows {
        outcome.commands.push(command);
        return;
    }
    match strip_disallowed_fields(&command, allowlist, &mut outcome.rejected) {
        Some(value) => outcome.commands.push(Command { value, ..command }),
        None => outcome
            .rejected
            .push(reject(GuardReason::SheetNotAllowed, &command.action, sheet)),
    }
}

/// Returns the command value with disallowed fields removed, or `None` if
/// nothing writable remains.
fn strip_disallowed_fields(
    command: &Command,
    allowlist: &StrictAllowlist,
    rejected: &mut Vec<GuardReject>,
) -> Option<Value> {
    let payloads = sheet_upserts(&command.action, &command.value).ok()?;
    let mut kept = Vec::new();
    for payload in payloads {
        let sheet = payload.sheet_id.as_str().to_owned();
        let Some(allowed) = allowlist
            .fields_for(&payload.sheet_id)
            .filter(|fields| !fields.is_empty())
        else {
            rejected.push(reject(
                GuardReason::SheetNotAllowed,
                &command.action,
                Some(&sheet),
            ));
            continue;
        };
        let mut rows = Vec::new();
        for row in payload.rows {
            let mut next = Map::new();
            for (field, value) in row {
                if allowed.contains(field.as_str()) {
                    next.insert(field, value);
                } else {
                    rejected.push(GuardReject {
                        reason: GuardReason::FieldNotAllowed,
                        action: command.action.as_str().to_owned(),
                        sheet: Some(sheet.clone()),
                        field: Some(field),
                    });
                }
            }
            if !next.is_empty() {
                rows.push(Value::Object(next));
            }
        }
        if !rows.is_empty() {
            let mut out = Map::new();
            out.insert("sheetId".to_owned(), Value::String(sheet));
            if let Some(key_field) = payload.key_field {
                out.insert("keyField".to_owned(), Value::String(key_field));
            }
            out.insert("rows".to_owned(), Value::Array(rows));
            kept.push(Value::Object(out));
        }
    }
    match (kept.len(), command.value.is_array()) {
        (0, _) => None,
        (_, true) => Some(Value::Array(kept)),
        (_, false) => kept.into_iter().next(),
    }
}
