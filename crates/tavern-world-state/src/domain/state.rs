//! The game state document.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tavern_core::event::TurnJournalEntry;
use tavern_core::sheet::SheetId;

use super::locks::ConflictStats;
use super::rows::{
    InteractionRecord, InventoryItem, LedgerEntry, NpcRecord, OutlineRow, SummaryRow,
};
use super::table::{SheetRow, SheetTable, Table};

/// Hidden base abilities feeding derived stats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Abilities {
    /// Raises carry capacity.
    #[serde(default)]
    pub strength: f64,
    /// Raises maximum hp and stamina.
    #[serde(default)]
    pub endurance: f64,
    /// Dexterity.
    #[serde(default)]
    pub dexterity: f64,
    /// Raises maximum stamina.
    #[serde(default)]
    pub agility: f64,
    /// Raises maximum mind.
    #[serde(default)]
    pub magic: f64,
}

/// The player character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerCharacter {
    /// Display name; excluded from NPC synthesis.
    pub name: String,
    /// Character level.
    pub level: u32,
    /// Personal currency balance.
    pub currency: f64,
    /// Current hit points.
    pub hp: f64,
    /// Derived maximum hit points.
    pub max_hp: f64,
    /// Current mind.
    pub mind: f64,
    /// Derived maximum mind.
    pub max_mind: f64,
    /// Current stamina.
    pub stamina: f64,
    /// Derived maximum stamina.
    pub max_stamina: f64,
    /// Derived carry capacity.
    pub max_carry: f64,
    /// Base abilities.
    #[serde(default)]
    pub abilities: Abilities,
}

impl Default for PlayerCharacter {
    fn default() -> Self {
        Self {
            name: "Adventurer".to_owned(),
            level: 1,
            currency: 0.0,
            hp: 100.0,
            max_hp: 100.0,
            mind: 50.0,
            max_mind: 50.0,
            stamina: 100.0,
            max_stamina: 100.0,
            max_carry: 50.0,
            abilities: Abilities::default(),
        }
    }
}

/// The player's familia.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Familia {
    /// Familia name.
    #[serde(default)]
    pub name: String,
    /// Shared funds balance.
    #[serde(default)]
    pub funds: f64,
}

/// World news and rumor tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldTables {
    /// News feed.
    pub news: Table<SheetRow>,
    /// Rumors.
    pub rumors: Table<SheetRow>,
}

/// Phone subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneState {
    /// Messages keyed by `message_id`.
    pub messages: Table<SheetRow>,
}

/// Combat state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatState {
    /// Whether a fight is under way.
    #[serde(default)]
    pub active: bool,
    /// Units in the encounter.
    pub encounter: Table<SheetRow>,
    /// Combat log lines.
    #[serde(default)]
    pub log: Vec<String>,
}

/// A line of the narrative log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeLogEntry {
    /// Speaker or `system`.
    pub sender: String,
    /// Line text.
    pub text: String,
    /// Turn the line belongs to.
    pub turn: u32,
    /// Raw service response the line was produced from. Never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

/// Table bookkeeping kept alongside the sheets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Version per `SHEET:row`, bumped on every write.
    #[serde(default)]
    pub row_versions: BTreeMap<String, u64>,
    /// Aggregated conflict counters.
    #[serde(default)]
    pub conflict_stats: ConflictStats,
    /// Transaction journal, newest last.
    #[serde(default)]
    pub journal: Vec<TurnJournalEntry>,
}

impl TableMeta {
    /// Storage key for a row version.
    #[must_use]
    pub fn version_key(sheet: &SheetId, row_key: &str) -> String {
        format!("{sheet}:{row_key}")
    }

    /// Current version of a row, zero if never written.
    #[must_use]
    pub fn row_version(&self, sheet: &SheetId, row_key: &str) -> u64 {
        self.row_versions
            .get(&Self::version_key(sheet, row_key))
            .copied()
            .unwrap_or(0)
    }

    /// Bumps and returns the version of a row.
    pub fn bump_row_version(&mut self, sheet: &SheetId, row_key: &str) -> u64 {
        let version = self
            .row_versions
            .entry(Self::version_key(sheet, row_key))
            .or_insert(0);
        *version += 1;
        *version
    }
}

/// A currency account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Account {
    /// The player's purse.
    CharacterCurrency,
    /// The familia treasury.
    FamiliaFunds,
}

impl Account {
    /// Parses an account name, accepting legacy spellings with or without
    /// the `gameState.` prefix.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let name = trimmed.strip_prefix("gameState.").unwrap_or(trimmed);
        match name {
            "character.currency" | "currency" | "角色.法利" => Some(Self::CharacterCurrency),
            "familia.funds" | "funds" | "眷族.资金" => Some(Self::FamiliaFunds),
            _ => None,
        }
    }

    /// Canonical account name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CharacterCurrency => "character.currency",
            Self::FamiliaFunds => "familia.funds",
        }
    }

    /// The `CHARACTER_Resources` column the account is exposed as.
    #[must_use]
    pub fn resource_field(self) -> &'static str {
        match self {
            Self::CharacterCurrency => "currency",
            Self::FamiliaFunds => "familia_funds",
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full state document for one game session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    /// Current turn number.
    pub turn: u32,
    /// In-game clock text.
    pub game_time: String,
    /// Current location.
    pub location: String,
    /// Current weather.
    pub weather: String,
    /// Player character.
    pub character: PlayerCharacter,
    /// Player familia.
    pub familia: Familia,
    /// `ITEM_Inventory`.
    pub inventory: Table<InventoryItem>,
    /// `NPC_Registry`.
    pub registry: Table<NpcRecord>,
    /// `NPC_InteractionLog`.
    pub interactions: Table<InteractionRecord>,
    /// `ECON_Ledger`.
    pub ledger: Table<LedgerEntry>,
    /// `LOG_Summary`.
    pub summaries: Table<SummaryRow>,
    /// `LOG_Outline`.
    pub outlines: Table<OutlineRow>,
    /// `WORLD_News` and `WORLD_Rumors`.
    pub world: WorldTables,
    /// `PHONE_Messages`.
    pub phone: PhoneState,
    /// Combat state and `COMBAT_Encounter`.
    pub combat: CombatState,
    /// Every other sheet, by wire name.
    #[serde(default)]
    pub sheets: BTreeMap<String, Table<SheetRow>>,
    /// Narrative log.
    #[serde(default)]
    pub log: Vec<NarrativeLogEntry>,
    /// Table bookkeeping.
    #[serde(default)]
    pub meta: TableMeta,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            turn: 0,
            game_time: String::new(),
            location: String::new(),
            weather: String::new(),
            character: PlayerCharacter::default(),
            familia: Familia::default(),
            inventory: Table::new(SheetId::ItemInventory.default_key_field()),
            registry: Table::new(SheetId::NpcRegistry.default_key_field()),
            interactions: Table::new(SheetId::NpcInteractionLog.default_key_field()),
            ledger: Table::new(SheetId::EconLedger.default_key_field()),
            summaries: Table::new(SheetId::LogSummary.default_key_field()),
            outlines: Table::new(SheetId::LogOutline.default_key_field()),
            world: WorldTables {
                news: Table::new(SheetId::WorldNews.default_key_field()),
                rumors: Table::new(SheetId::WorldRumors.default_key_field()),
            },
            phone: PhoneState {
                messages: Table::new(SheetId::PhoneMessages.default_key_field()),
            },
            combat: CombatState {
                active: false,
                encounter: Table::new(SheetId::CombatEncounter.default_key_field()),
                log: Vec::new(),
            },
            sheets: BTreeMap::new(),
            log: Vec::new(),
            meta: TableMeta::default(),
        }
    }
}

impl GameState {
    /// Balance of a currency account.
    #[must_use]
    pub fn balance(&self, account: Account) -> f64 {
        match account {
            Account::CharacterCurrency => self.character.currency,
            Account::FamiliaFunds => self.familia.funds,
        }
    }

    /// Overwrites the balance of a currency account.
    pub fn set_balance(&mut self, account: Account, value: f64) {
        match account {
            Account::CharacterCurrency => self.character.currency = value,
            Account::FamiliaFunds => self.familia.funds = value,
        }
    }

    /// Registry id of the character with this display name.
    #[must_use]
    pub fn npc_id_by_name(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        self.registry
            .iter()
            .find(|npc| npc.name.trim() == name)
            .map(|npc| npc.npc_id.as_str())
    }

    /// Display name of the character with this registry id, compared
    /// case-insensitively.
    #[must_use]
    pub fn npc_name_by_id(&self, id: &str) -> Option<&str> {
        let id = id.trim();
        self.registry
            .get(id)
            .or_else(|| {
                self.registry
                    .iter()
                    .find(|npc| npc.npc_id.eq_ignore_ascii_case(id))
            })
            .map(|npc| npc.name.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Returns the table backing a sheet, creating auxiliary sheets on
    /// demand. `SYS_GlobalState` and `CHARACTER_Resources` are projections
    /// of scalar fields and have no table.
    pub fn sheet_table_mut(&mut self, sheet: &SheetId) -> Option<&mut dyn SheetTable> {
        match sheet {
            SheetId::GlobalState | SheetId::CharacterResources => None,
            SheetId::NpcRegistry => Some(&mut self.registry),
            SheetId::NpcInteractionLog => Some(&mut self.interactions),
            SheetId::ItemInventory => Some(&mut self.inventory),
            SheetId::EconLedger => Some(&mut self.ledger),
            SheetId::LogSummary => Some(&mut self.summaries),
            SheetId::LogOutline => Some(&mut self.outlines),
            SheetId::WorldNews => Some(&mut self.world.news),
            SheetId::WorldRumors => Some(&mut self.world.rumors),
            SheetId::PhoneMessages => Some(&mut self.phone.messages),
            SheetId::CombatEncounter => Some(&mut self.combat.encounter),
            SheetId::ExplorationMap
            | SheetId::MapVisuals
            | SheetId::BattleMap
            | SheetId::Custom(_) => Some(
                self.sheets
                    .entry(sheet.as_str().to_owned())
                    .or_insert_with(|| Table::new(sheet.default_key_field())),
            ),
        }
    }

    /// Auxiliary sheet by id, if it has been written.
    #[must_use]
    pub fn auxiliary_sheet(&self, sheet: &SheetId) -> Option<&Table<SheetRow>> {
        self.sheets.get(sheet.as_str())
    }

    /// Appends a system line to the narrative log.
    pub fn push_system_note(&mut self, text: impl Into<String>) {
        self.log.push(NarrativeLogEntry {
            sender: "system".to_owned(),
            text: text.into(),
            turn: self.turn,
            raw_response: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_parse_accepts_legacy_names() {
        assert_eq!(
            Account::parse("gameState.角色.法利"),
            Some(Account::CharacterCurrency)
        );
        assert_eq!(Account::parse("familia.funds"), Some(Account::FamiliaFunds));
        assert_eq!(Account::parse("character.hp"), None);
    }

    #[test]
    fn test_balance_round_trips_through_setter() {
        let mut state = GameState::default();

        state.set_balance(Account::FamiliaFunds, 42.5);

        assert!((state.balance(Account::FamiliaFunds) - 42.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_npc_lookup_by_name_and_id() {
        let mut state = GameState::default();
        state.registry.insert(NpcRecord {
            npc_id: "NPC_Eina".into(),
            name: "Eina".into(),
            ..NpcRecord::default()
        });

        assert_eq!(state.npc_id_by_name(" Eina "), Some("NPC_Eina"));
        assert_eq!(state.npc_name_by_id("npc_eina"), Some("Eina"));
    }

    #[test]
    fn test_auxiliary_sheet_is_created_on_demand() {
        let mut state = GameState::default();
        let quest = SheetId::Custom("QUEST_Active".into());

        assert!(state.sheet_table_mut(&quest).is_some());
        assert!(state.auxiliary_sheet(&quest).is_some());
        assert!(state.sheet_table_mut(&SheetId::GlobalState).is_none());
    }

    #[test]
    fn test_row_versions_bump_per_row() {
        let mut meta = TableMeta::default();

        meta.bump_row_version(&SheetId::NpcRegistry, "NPC_1");
        meta.bump_row_version(&SheetId::NpcRegistry, "NPC_1");

        assert_eq!(meta.row_version(&SheetId::NpcRegistry, "NPC_1"), 2);
        assert_eq!(meta.row_version(&SheetId::NpcRegistry, "NPC_2"), 0);
    }
}
