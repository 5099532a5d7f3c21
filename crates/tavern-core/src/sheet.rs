//! Sheet identifiers and their declared key fields.
//!
//! A sheet is a named table inside the game state. Well-known sheets map to
//! typed tables; anything else is carried as an auxiliary sheet.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a sheet within the game state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SheetId {
    /// Scalar world clock, location and weather.
    GlobalState,
    /// Player vitals, attributes and currency.
    CharacterResources,
    /// Character/NPC registry.
    NpcRegistry,
    /// Per-NPC interaction log.
    NpcInteractionLog,
    /// Player inventory.
    ItemInventory,
    /// Economic ledger.
    EconLedger,
    /// Derived per-turn summary rows.
    LogSummary,
    /// Derived per-turn outline rows.
    LogOutline,
    /// World news feed.
    WorldNews,
    /// World rumor table.
    WorldRumors,
    /// Phone messages.
    PhoneMessages,
    /// Combat encounter units.
    CombatEncounter,
    /// Exploration map payloads.
    ExplorationMap,
    /// Battle map visual settings.
    MapVisuals,
    /// Battle map unit rows.
    BattleMap,
    /// Any other sheet.
    Custom(String),
}

impl SheetId {
    /// Returns the wire name of the sheet.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::GlobalState => "SYS_GlobalState",
            Self::CharacterResources => "CHARACTER_Resources",
            Self::NpcRegistry => "NPC_Registry",
            Self::NpcInteractionLog => "NPC_InteractionLog",
            Self::ItemInventory => "ITEM_Inventory",
            Self::EconLedger => "ECON_Ledger",
            Self::LogSummary => "LOG_Summary",
            Self::LogOutline => "LOG_Outline",
            Self::WorldNews => "WORLD_News",
            Self::WorldRumors => "WORLD_Rumors",
            Self::PhoneMessages => "PHONE_Messages",
            Self::CombatEncounter => "COMBAT_Encounter",
            Self::ExplorationMap => "EXPLORATION_Map_Data",
            Self::MapVisuals => "COMBAT_Map_Visuals",
            Self::BattleMap => "COMBAT_BattleMap",
            Self::Custom(name) => name,
        }
    }

    /// Parses a wire name, trimming whitespace. Unknown names become
    /// `Custom`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "SYS_GlobalState" => Self::GlobalState,
            "CHARACTER_Resources" => Self::CharacterResources,
            "NPC_Registry" => Self::NpcRegistry,
            "NPC_InteractionLog" => Self::NpcInteractionLog,
            "ITEM_Inventory" => Self::ItemInventory,
            "ECON_Ledger" => Self::EconLedger,
            "LOG_Summary" => Self::LogSummary,
            "LOG_Outline" => Self::LogOutline,
            "WORLD_News" => Self::WorldNews,
            "WORLD_Rumors" => Self::WorldRumors,
            "PHONE_Messages" => Self::PhoneMessages,
            "COMBAT_Encounter" => Self::CombatEncounter,
            "EXPLORATION_Map_Data" => Self::ExplorationMap,
            "COMBAT_Map_Visuals" => Self::MapVisuals,
            "COMBAT_BattleMap" => Self::BattleMap,
            other => Self::Custom(other.to_owned()),
        }
    }

    /// The key field used for upserts when a payload does not declare one.
    #[must_use]
    pub fn default_key_field(&self) -> &'static str {
        match self {
            Self::GlobalState => "_global_id",
            Self::CharacterResources => "CHAR_ID",
            Self::NpcRegistry => "npc_id",
            Self::NpcInteractionLog => "interaction_id",
            Self::ItemInventory => "item_id",
            Self::EconLedger => "ledger_id",
            Self::LogSummary | Self::LogOutline => "turn",
            Self::PhoneMessages => "message_id",
            Self::CombatEncounter | Self::BattleMap => "unit_name",
            Self::WorldNews
            | Self::WorldRumors
            | Self::ExplorationMap
            | Self::MapVisuals
            | Self::Custom(_) => "id",
        }
    }

    /// Sheets only the memory service may write.
    #[must_use]
    pub fn is_memory_owned(&self) -> bool {
        matches!(self, Self::LogSummary | Self::LogOutline)
    }
}

impl fmt::Display for SheetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for SheetId {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<SheetId> for String {
    fn from(value: SheetId) -> Self {
        value.as_str().to_owned()
    }
}

impl FromStr for SheetId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}
