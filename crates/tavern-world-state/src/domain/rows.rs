//! Typed rows for the well-known sheets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::table::{RowKey, TableRow};

/// A character in the NPC registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NpcRecord {
    /// Stable identifier.
    pub npc_id: String,
    /// Display name; dialogue speakers are matched against it.
    #[serde(default)]
    pub name: String,
    /// Free-form status: `present`, `left`, `dead`, `missing`, …
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Whether the character is in the current scene.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present: Option<bool>,
    /// Last known location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Affinity towards the player, 0–100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<i64>,
    /// Whether the character travels with the player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_companion: Option<bool>,
    /// Companion current vitals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hp: Option<f64>,
    /// Companion maximum vitals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hp: Option<f64>,
    /// Fields this engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRow for NpcRecord {
    const FIELD_ALIASES: &'static [(&'static str, &'static str)] = &[
        ("NPC_ID", "npc_id"),
        ("id", "npc_id"),
        ("npc_name", "name"),
        ("NPC", "name"),
        ("姓名", "name"),
        ("当前状态", "status"),
        ("是否在场", "present"),
        ("所在位置", "location"),
        ("好感度", "affinity"),
        ("是否队友", "is_companion"),
        ("生命值", "hp"),
        ("最大生命值", "max_hp"),
    ];

    fn row_key(&self, _key_field: &str) -> Option<RowKey> {
        Some(self.npc_id.clone()).filter(|id| !id.is_empty())
    }
}

/// One logged interaction with an NPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    /// Row identifier.
    pub interaction_id: String,
    /// NPC the interaction involved.
    #[serde(default)]
    pub npc_id: String,
    /// NPC display name at the time.
    #[serde(default)]
    pub npc_name: String,
    /// In-game timestamp.
    #[serde(default)]
    pub timestamp: String,
    /// Interaction type, e.g. `dialogue`.
    #[serde(default, rename = "type")]
    pub kind: String,
    /// One-line summary.
    #[serde(default)]
    pub summary: String,
    /// Who produced the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Fields this engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRow for InteractionRecord {
    const FIELD_ALIASES: &'static [(&'static str, &'static str)] = &[
        ("NPC_ID", "npc_id"),
        ("姓名", "npc_name"),
        ("kind", "type"),
    ];

    fn row_key(&self, _key_field: &str) -> Option<RowKey> {
        Some(self.interaction_id.clone()).filter(|id| !id.is_empty())
    }
}

/// An inventory item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    /// Item identifier.
    pub item_id: String,
    /// Item name; pushes merge on it.
    #[serde(default)]
    pub name: String,
    /// Stack size.
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    /// Fields this engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_quantity() -> i64 {
    1
}

impl TableRow for InventoryItem {
    const FIELD_ALIASES: &'static [(&'static str, &'static str)] = &[
        ("id", "item_id"),
        ("物品ID", "item_id"),
        ("名称", "name"),
        ("物品名称", "name"),
        ("数量", "quantity"),
    ];

    fn row_key(&self, _key_field: &str) -> Option<RowKey> {
        Some(self.item_id.clone()).filter(|id| !id.is_empty())
    }
}

/// One economic ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry identifier.
    pub ledger_id: String,
    /// Turn the entry was recorded in.
    #[serde(default)]
    pub turn: u32,
    /// In-game or wall-clock timestamp.
    #[serde(default)]
    pub timestamp: String,
    /// Account the delta applied to.
    #[serde(default)]
    pub account: String,
    /// Balance before.
    #[serde(default)]
    pub before: f64,
    /// Signed change.
    #[serde(default)]
    pub delta: f64,
    /// Balance after.
    #[serde(default)]
    pub after: f64,
    /// Why the money moved.
    #[serde(default)]
    pub reason: String,
    /// Reference to the originating command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_ref: Option<String>,
    /// Service that produced the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TableRow for LedgerEntry {
    const FIELD_ALIASES: &'static [(&'static str, &'static str)] =
        &[("id", "ledger_id"), ("commandRef", "command_ref")];

    fn row_key(&self, _key_field: &str) -> Option<RowKey> {
        Some(self.ledger_id.clone()).filter(|id| !id.is_empty())
    }
}

/// Derived per-turn summary row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    /// Turn the row summarizes.
    pub turn: u32,
    /// AM-code shared with the paired outline row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub am_code: Option<String>,
    /// In-game time span covered.
    #[serde(default)]
    pub time_span: String,
    /// Summary text.
    #[serde(default)]
    pub summary: String,
    /// Fields this engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRow for SummaryRow {
    const FIELD_ALIASES: &'static [(&'static str, &'static str)] = &[
        ("编码索引", "am_code"),
        ("amIndex", "am_code"),
        ("am_index", "am_code"),
        ("回合", "turn"),
        ("时间跨度", "time_span"),
        ("纪要", "summary"),
        ("content", "summary"),
        ("text", "summary"),
    ];

    fn row_key(&self, _key_field: &str) -> Option<RowKey> {
        Some(self.turn.to_string())
    }
}

/// Derived per-turn outline row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutlineRow {
    /// Turn the row outlines.
    pub turn: u32,
    /// AM-code shared with the paired summary row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub am_code: Option<String>,
    /// Chapter or arc title.
    #[serde(default)]
    pub title: String,
    /// Outline text.
    #[serde(default)]
    pub outline: String,
    /// Fields this engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRow for OutlineRow {
    const FIELD_ALIASES: &'static [(&'static str, &'static str)] = &[
        ("编码索引", "am_code"),
        ("amIndex", "am_code"),
        ("am_index", "am_code"),
        ("回合", "turn"),
        ("章节", "title"),
        ("大纲", "outline"),
        ("content", "outline"),
        ("text", "outline"),
    ];

    fn row_key(&self, _key_field: &str) -> Option<RowKey> {
        Some(self.turn.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::table::Table;
    use serde_json::json;

    #[test]
    fn test_npc_record_keeps_unknown_fields_in_extra() {
        let record: NpcRecord = serde_json::from_value(json!({
            "npc_id": "NPC_1",
            "name": "Eina",
            "occupation": "advisor"
        }))
        .unwrap();

        assert_eq!(record.extra.get("occupation"), Some(&json!("advisor")));
    }

    #[test]
    fn test_summary_rows_are_keyed_by_turn() {
        // Arrange
        let mut table: Table<SummaryRow> = Table::new("turn");
        let patch = json!({ "回合": 4, "纪要": "Entered the dungeon" });

        // Act
        let outcome = table
            .upsert_patch(patch.as_object().unwrap(), "LOG_Summary")
            .unwrap();

        // Assert
        assert_eq!(outcome.key, "4");
        assert_eq!(table.get("4").unwrap().summary, "Entered the dungeon");
    }

    #[test]
    fn test_inventory_item_defaults_quantity_to_one() {
        let item: InventoryItem =
            serde_json::from_value(json!({ "item_id": "Item_1", "name": "Potion" })).unwrap();

        assert_eq!(item.quantity, 1);
    }
}
