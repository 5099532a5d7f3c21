//! Canonical command vocabulary.
//!
//! Every generation service speaks some dialect of "command"; the normalizer
//! reduces them all to [`Command`] before anything else looks at them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The generation services that produce or consume commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKey {
    /// Story prose generation.
    Narrative,
    /// Structured state updates.
    State,
    /// Derived summary/outline rows.
    Memory,
    /// Map payloads.
    Map,
    /// In-game phone messages.
    Phone,
}

impl ServiceKey {
    /// Returns the lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Narrative => "narrative",
            Self::State => "state",
            Self::Memory => "memory",
            Self::Map => "map",
            Self::Phone => "phone",
        }
    }

    /// Resolves a raw service key to one of the three routable handlers.
    /// Anything that is not `memory` or `map` routes to `state`.
    #[must_use]
    pub fn route(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Self::Memory,
            "map" => Self::Map,
            _ => Self::State,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Assign a value at a path.
    Set,
    /// Numerically accumulate at a path.
    Add,
    /// Append to a collection at a path.
    Push,
    /// Remove by key or index at a path.
    Delete,
    /// Upsert rows into a sheet.
    UpsertSheetRows,
    /// Delete rows from a sheet.
    DeleteSheetRows,
    /// Upsert registry characters.
    UpsertCharacter,
    /// Upsert inventory items.
    UpsertInventory,
    /// Apply a signed delta to a currency account.
    ApplyEconDelta,
    /// Record a ledger entry (applies its delta).
    AppendEconLedger,
    /// Append a per-turn summary row.
    AppendLogSummary,
    /// Append a per-turn outline row.
    AppendLogOutline,
    /// Store an exploration map payload.
    UpsertExplorationMap,
    /// Store battle map visuals.
    SetMapVisuals,
    /// Upsert battle map unit rows.
    UpsertBattleMapRows,
    /// An action this engine does not recognize.
    Other(String),
}

impl Action {
    /// Parses an action name case-insensitively, accepting legacy aliases.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "set" => Self::Set,
            "add" => Self::Add,
            "push" => Self::Push,
            "delete" => Self::Delete,
            "upsert_sheet_rows" => Self::UpsertSheetRows,
            "delete_sheet_rows" => Self::DeleteSheetRows,
            "upsert_character" | "upsert_npc" => Self::UpsertCharacter,
            "upsert_inventory" => Self::UpsertInventory,
            "apply_econ_delta" => Self::ApplyEconDelta,
            "append_econ_ledger" => Self::AppendEconLedger,
            "append_log_summary" => Self::AppendLogSummary,
            "append_log_outline" => Self::AppendLogOutline,
            "upsert_exploration_map" => Self::UpsertExplorationMap,
            "set_map_visuals" => Self::SetMapVisuals,
            "upsert_battle_map_rows" => Self::UpsertBattleMapRows,
            _ => Self::Other(raw.trim().to_owned()),
        }
    }

    /// Returns the canonical wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
            Self::Push => "push",
            Self::Delete => "delete",
            Self::UpsertSheetRows => "upsert_sheet_rows",
            Self::DeleteSheetRows => "delete_sheet_rows",
            Self::UpsertCharacter => "upsert_character",
            Self::UpsertInventory => "upsert_inventory",
            Self::ApplyEconDelta => "apply_econ_delta",
            Self::AppendEconLedger => "append_econ_ledger",
            Self::AppendLogSummary => "append_log_summary",
            Self::AppendLogOutline => "append_log_outline",
            Self::UpsertExplorationMap => "upsert_exploration_map",
            Self::SetMapVisuals => "set_map_visuals",
            Self::UpsertBattleMapRows => "upsert_battle_map_rows",
            Self::Other(name) => name,
        }
    }

    /// Path actions address state through a dotted key.
    #[must_use]
    pub fn is_path_action(&self) -> bool {
        matches!(self, Self::Set | Self::Add | Self::Push | Self::Delete)
    }

    /// Actions whose payload is required to be present.
    #[must_use]
    pub fn requires_value(&self) -> bool {
        !matches!(self, Self::Delete | Self::Other(_))
    }

    /// Actions that write the derived memory log.
    #[must_use]
    pub fn is_memory_log(&self) -> bool {
        matches!(self, Self::AppendLogSummary | Self::AppendLogOutline)
    }

    /// Actions that write map payloads.
    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(
            self,
            Self::UpsertExplorationMap | Self::SetMapVisuals | Self::UpsertBattleMapRows
        )
    }

    /// Actions that move money.
    #[must_use]
    pub fn is_economic(&self) -> bool {
        matches!(self, Self::ApplyEconDelta | Self::AppendEconLedger)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Action> for String {
    fn from(value: Action) -> Self {
        value.as_str().to_owned()
    }
}

/// A canonical command: one write against the game state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// What to do.
    pub action: Action,
    /// Dotted/bracket state path for path actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Action payload.
    #[serde(default)]
    pub value: Value,
    /// Service that produced the command.
    pub source_service: ServiceKey,
}

impl Command {
    /// Creates a command without a path.
    #[must_use]
    pub fn new(action: Action, value: Value, source_service: ServiceKey) -> Self {
        Self {
            action,
            key: None,
            value,
            source_service,
        }
    }

    /// Creates a path command.
    #[must_use]
    pub fn at_path(
        action: Action,
        key: impl Into<String>,
        value: Value,
        source_service: ServiceKey,
    ) -> Self {
        Self {
            action,
            key: Some(key.into()),
            value,
            source_service,
        }
    }

    /// Returns the sheet named by the command's payload, if any.
    ///
    /// Looks at `sheetId`/`sheet_id` on an object payload, or on the first
    /// element of an array payload.
    #[must_use]
    pub fn payload_sheet(&self) -> Option<&str> {
        let payload = match &self.value {
            Value::Array(items) => items.first()?,
            other => other,
        };
        payload
            .get("sheetId")
            .or_else(|| payload.get("sheet_id"))
            .and_then(Value::as_str)
    }
}
