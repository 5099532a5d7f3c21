//! Sheet-oriented actions: row upserts and deletes, registry and inventory
//! upserts, memory log rows and map payloads.

use serde_json::{Map, Value};
use tavern_commands::domain::payloads::{econ_deltas, payload_rows, sheet_deletes, sheet_upserts};
use tavern_core::command::{Action, Command};
use tavern_core::error::DomainError;
use tavern_core::sheet::SheetId;
use tavern_world_state::domain::paths::{FamiliaField, StatePath};
use tavern_world_state::domain::state::GameState;
use tavern_world_state::domain::table::{RowKey, SheetTable};
use tracing::debug;

use super::economy::{EconomyContext, apply_econ_delta};
use super::gate::{CommandWriter, EXPECTED_VERSION_FIELD, RowTouch, take_expected_version};
use super::mutation::set_path;

/// Row id given to the battle map visuals when the payload names none.
pub const MAP_VISUALS_ID: &str = "visuals";

fn malformed(action: &Action, detail: impl Into<String>) -> DomainError {
    DomainError::MalformedPayload {
        action: action.as_str().to_owned(),
        detail: detail.into(),
    }
}

/// Prefix of generated keys for rows written without one.
#[must_use]
pub fn generated_prefix(sheet: &SheetId) -> &'static str {
    match sheet {
        SheetId::NpcRegistry => "NPC",
        SheetId::NpcInteractionLog => "INT",
        SheetId::ItemInventory => "Item",
        SheetId::EconLedger => "LEDGER",
        SheetId::LogSummary | SheetId::LogOutline => "LOG",
        SheetId::WorldNews => "NEWS",
        SheetId::WorldRumors => "RUMOR",
        SheetId::PhoneMessages => "MSG",
        SheetId::CombatEncounter | SheetId::BattleMap => "UNIT",
        SheetId::ExplorationMap => "MAP",
        SheetId::MapVisuals => "VISUAL",
        SheetId::GlobalState | SheetId::CharacterResources | SheetId::Custom(_) => "ROW",
    }
}

fn find_key_by_field(table: &dyn SheetTable, field: &str, value: &Value) -> Option<RowKey> {
    (0..table.row_count())
        .filter_map(|i| table.key_at(i))
        .find(|key| {
            table
                .row_json(key)
                .is_some_and(|row| row.get(field) == Some(value))
        })
}

/// Upserts row patches into a keyed sheet. A `key_field` other than the
/// table's own identifies existing rows by that column.
///
/// # Errors
///
/// Returns `DomainError::Validation` for scalar sheets,
/// `DomainError::MalformedPayload` for rows that do not fit the sheet, and
/// any scope or conflict rejection.
pub fn upsert_table_rows(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    action: &Action,
    sheet: &SheetId,
    key_field: Option<&str>,
    rows: Vec<Map<String, Value>>,
) -> Result<(), DomainError> {
    for mut row in rows {
        let expected = take_expected_version(&mut row);
        let table = state
            .sheet_table_mut(sheet)
            .ok_or_else(|| DomainError::Validation(format!("{sheet} is not a keyed sheet")))?;
        let mut patch = table.canonicalize(&row);
        if let Some(field) = key_field.filter(|field| *field != table.key_field())
            && table.patch_key(&patch).is_none()
            && let Some(value) = patch.get(field)
            && let Some(existing) = find_key_by_field(table, field, value)
        {
            patch.insert(table.key_field().to_owned(), Value::String(existing));
        }
        let upserted = table
            .upsert(&patch, generated_prefix(sheet))
            .map_err(|e| malformed(action, e.to_string()))?;
        debug!(sheet = %sheet, row_key = %upserted.key, kind = ?upserted.kind, "row upserted");
        writer.admit(&RowTouch {
            sheet,
            row_key: &upserted.key,
            fields: &patch,
            expected_version: expected,
        })?;
    }
    Ok(())
}

fn scalar_path(sheet: &SheetId, field: &str) -> Option<StatePath> {
    match sheet {
        SheetId::CharacterResources => match field {
            "familia_funds" => Some(StatePath::Familia(FamiliaField::Funds)),
            "familia_name" => Some(StatePath::Familia(FamiliaField::Name)),
            other => StatePath::parse(&format!("character.{other}")).ok(),
        },
        SheetId::GlobalState => match field {
            "combat_active" => Some(StatePath::CombatActive),
            other => StatePath::parse(other).ok().filter(|path| {
                matches!(
                    path,
                    StatePath::GameTime | StatePath::Location | StatePath::Weather
                )
            }),
        },
        _ => None,
    }
}

/// Projects rows written to `CHARACTER_Resources` or `SYS_GlobalState`
/// onto the scalar fields they mirror. Unknown columns are skipped with a
/// warning.
fn project_scalar_rows(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    sheet: &SheetId,
    rows: Vec<Map<String, Value>>,
) -> Result<(), DomainError> {
    for row in rows {
        for (field, value) in row {
            if field == sheet.default_key_field() || field == EXPECTED_VERSION_FIELD {
                continue;
            }
            let Some(path) = scalar_path(sheet, &field) else {
                writer.warn(format!("{sheet}.{field} is not a known column; skipped"));
                continue;
            };
            set_path(state, writer, ctx, &path, &value)?;
        }
    }
    Ok(())
}

/// Executes `upsert_sheet_rows`.
///
/// Scalar sheets are projected onto their fields, and ledger rows move
/// money the same way `apply_econ_delta` does.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` for undecodable payloads and
/// any per-row error.
pub fn upsert_sheet_rows(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    command: &Command,
) -> Result<(), DomainError> {
    for payload in sheet_upserts(&command.action, &command.value)? {
        match &payload.sheet_id {
            SheetId::CharacterResources | SheetId::GlobalState => {
                project_scalar_rows(state, writer, ctx, &payload.sheet_id, payload.rows)?;
            }
            SheetId::EconLedger => {
                writer.permits_economy()?;
                let rows = Value::Array(payload.rows.into_iter().map(Value::Object).collect());
                for delta in econ_deltas(&command.action, &rows)? {
                    apply_econ_delta(state, writer, ctx, &delta)?;
                }
            }
            sheet => upsert_table_rows(
                state,
                writer,
                &command.action,
                sheet,
                payload.key_field.as_deref(),
                payload.rows,
            )?,
        }
    }
    Ok(())
}

/// Executes `delete_sheet_rows`. Missing rows only warn.
///
/// # Errors
///
/// Returns `DomainError::Validation` for scalar sheets and any scope or
/// conflict rejection.
pub fn delete_sheet_rows(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    command: &Command,
) -> Result<(), DomainError> {
    let no_fields = Map::new();
    for payload in sheet_deletes(&command.action, &command.value)? {
        let sheet = &payload.sheet_id;
        for row_id in &payload.row_ids {
            let table = state
                .sheet_table_mut(sheet)
                .ok_or_else(|| DomainError::Validation(format!("{sheet} rows cannot be deleted")))?;
            if !table.remove_key(row_id) {
                writer.warn(format!("{sheet} row {row_id} not found"));
                continue;
            }
            writer.admit(&RowTouch {
                sheet,
                row_key: row_id,
                fields: &no_fields,
                expected_version: None,
            })?;
        }
    }
    Ok(())
}

/// Executes `upsert_character` and `upsert_inventory`.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` for undecodable rows and any
/// per-row error.
pub fn upsert_typed_rows(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    command: &Command,
) -> Result<(), DomainError> {
    let sheet = match command.action {
        Action::UpsertInventory => SheetId::ItemInventory,
        _ => SheetId::NpcRegistry,
    };
    let rows = payload_rows(&command.action, &command.value)?;
    upsert_table_rows(state, writer, &command.action, &sheet, None, rows)
}

/// Executes `append_log_summary` and `append_log_outline`. Rows without a
/// turn are stamped with the current one.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` for undecodable rows and any
/// per-row error.
pub fn append_log_rows(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    command: &Command,
) -> Result<(), DomainError> {
    let sheet = match command.action {
        Action::AppendLogOutline => SheetId::LogOutline,
        _ => SheetId::LogSummary,
    };
    let mut rows = payload_rows(&command.action, &command.value)?;
    for row in &mut rows {
        if !row.contains_key("turn") && !row.contains_key("回合") {
            row.insert("turn".to_owned(), Value::from(state.turn));
        }
    }
    upsert_table_rows(state, writer, &command.action, &sheet, None, rows)
}

/// Executes the map actions. Map payloads are stored as auxiliary sheets.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` for undecodable payloads and any
/// per-row error.
pub fn apply_map_command(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    command: &Command,
) -> Result<(), DomainError> {
    let (sheet, rows) = match command.action {
        Action::SetMapVisuals => {
            let mut visuals = command
                .value
                .as_object()
                .cloned()
                .ok_or_else(|| malformed(&command.action, "expected an object"))?;
            visuals
                .entry("id")
                .or_insert_with(|| Value::String(MAP_VISUALS_ID.to_owned()));
            (SheetId::MapVisuals, vec![visuals])
        }
        Action::UpsertBattleMapRows => (
            SheetId::BattleMap,
            payload_rows(&command.action, &command.value)?,
        ),
        _ => (
            SheetId::ExplorationMap,
            payload_rows(&command.action, &command.value)?,
        ),
    };
    upsert_table_rows(state, writer, &command.action, &sheet, None, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::economy::DEFAULT_LEDGER_CAP;
    use crate::domain::gate::{CommandEffects, OpenGate};
    use serde_json::json;
    use tavern_core::command::ServiceKey;
    use tavern_test_support::{FixedClock, sample_state};
    use tavern_world_state::domain::state::TableMeta;

    fn run(state: &mut GameState, command: &Command) -> Result<CommandEffects, DomainError> {
        let clock = FixedClock::default();
        let ctx = EconomyContext {
            clock: &clock,
            ledger_cap: DEFAULT_LEDGER_CAP,
            source: command.source_service,
        };
        let mut gate = OpenGate;
        let mut meta = TableMeta::default();
        let mut writer = CommandWriter::new(&mut gate, &mut meta);
        match &command.action {
            Action::UpsertSheetRows => upsert_sheet_rows(state, &mut writer, &ctx, command)?,
            Action::DeleteSheetRows => delete_sheet_rows(state, &mut writer, command)?,
            Action::UpsertCharacter | Action::UpsertInventory => {
                upsert_typed_rows(state, &mut writer, command)?;
            }
            Action::AppendLogSummary | Action::AppendLogOutline => {
                append_log_rows(state, &mut writer, command)?;
            }
            _ => apply_map_command(state, &mut writer, command)?,
        }
        Ok(writer.finish())
    }

    fn command(action: Action, value: Value) -> Command {
        Command::new(action, value, ServiceKey::State)
    }

    #[test]
    fn test_upsert_sheet_rows_merges_registry_rows() {
        // Arrange
        let mut state = sample_state();
        let upsert = command(
            Action::UpsertSheetRows,
            json!({
                "sheetId": "NPC_Registry",
                "keyField": "npc_id",
                "rows": [
                    { "npc_id": "NPC_Eina", "好感度": 40 },
                    { "npc_id": "NPC_Bell", "name": "Bell" }
                ]
            }),
        );

        // Act
        run(&mut state, &upsert).unwrap();

        // Assert
        assert_eq!(state.registry.len(), 3);
        let eina = state.registry.get("NPC_Eina").unwrap();
        assert_eq!(eina.name, "Eina");
        assert_eq!(eina.affinity, Some(40));
    }

    #[test]
    fn test_key_field_override_finds_existing_row() {
        let mut state = sample_state();
        let upsert = command(
            Action::UpsertSheetRows,
            json!({
                "sheetId": "NPC_Registry",
                "keyField": "name",
                "rows": [{ "name": "Lili", "location": "Guild" }]
            }),
        );

        run(&mut state, &upsert).unwrap();

        assert_eq!(state.registry.len(), 2);
        assert_eq!(
            state.registry.get("NPC_Lili").unwrap().location.as_deref(),
            Some("Guild")
        );
    }

    #[test]
    fn test_character_resources_rows_project_onto_the_character() {
        // Arrange
        let mut state = sample_state();
        let upsert = command(
            Action::UpsertSheetRows,
            json!({
                "sheetId": "CHARACTER_Resources",
                "rows": [{ "CHAR_ID": "PLAYER", "hp": 60, "familia_funds": 25, "aura": 3 }]
            }),
        );

        // Act
        let effects = run(&mut state, &upsert).unwrap();

        // Assert
        assert!((state.character.hp - 60.0).abs() < f64::EPSILON);
        assert!((state.familia.funds - 25.0).abs() < f64::EPSILON);
        assert_eq!(effects.ledger_entries.len(), 1);
        assert_eq!(
            effects.warnings,
            vec!["CHARACTER_Resources.aura is not a known column; skipped"]
        );
    }

    #[test]
    fn test_ledger_rows_move_money() {
        let mut state = sample_state();
        let upsert = command(
            Action::UpsertSheetRows,
            json!({ "sheetId": "ECON_Ledger", "rows": [{ "delta": -20, "reason": "ale" }] }),
        );

        let effects = run(&mut state, &upsert).unwrap();

        assert!((state.character.currency - 180.0).abs() < f64::EPSILON);
        assert_eq!(effects.ledger_entries, vec!["LEDGER_3_1"]);
    }

    #[test]
    fn test_delete_sheet_rows_warns_on_missing_rows() {
        // Arrange
        let mut state = sample_state();
        let delete = command(
            Action::DeleteSheetRows,
            json!({ "sheetId": "NPC_Registry", "rowIds": ["NPC_Eina", "NPC_Ghost"] }),
        );

        // Act
        let effects = run(&mut state, &delete).unwrap();

        // Assert
        assert!(!state.registry.contains_key("NPC_Eina"));
        assert_eq!(effects.warnings, vec!["NPC_Registry row NPC_Ghost not found"]);
    }

    #[test]
    fn test_upsert_character_alias_and_inventory() {
        let mut state = sample_state();

        let npc = json!([{ "npc_id": "NPC_Hestia", "name": "Hestia" }]);
        let item = json!({ "item_id": "knife", "name": "Hestia Knife" });

        run(&mut state, &command(Action::parse("upsert_npc"), npc)).unwrap();
        run(&mut state, &command(Action::UpsertInventory, item)).unwrap();

        assert!(state.registry.contains_key("NPC_Hestia"));
        assert_eq!(state.inventory.get("knife").unwrap().quantity, 1);
    }

    #[test]
    fn test_log_rows_default_to_the_current_turn() {
        let mut state = sample_state();

        let row = json!({ "summary": "Met Eina.", "编码索引": "AM0003" });

        run(&mut state, &command(Action::AppendLogSummary, row)).unwrap();

        let row = state.summaries.get("3").unwrap();
        assert_eq!(row.am_code.as_deref(), Some("AM0003"));
        assert_eq!(row.summary, "Met Eina.");
    }

    #[test]
    fn test_map_actions_land_in_auxiliary_sheets() {
        // Arrange
        let mut state = sample_state();

        // Act
        run(&mut state, &command(Action::SetMapVisuals, json!({ "grid": 12 }))).unwrap();
        run(
            &mut state,
            &command(
                Action::UpsertBattleMapRows,
                json!({ "rows": [{ "unit_name": "Goblin", "x": 1, "y": 2 }] }),
            ),
        )
        .unwrap();

        // Assert
        let visuals = state.auxiliary_sheet(&SheetId::MapVisuals).unwrap();
        assert!(visuals.contains_key(MAP_VISUALS_ID));
        let battle = state.auxiliary_sheet(&SheetId::BattleMap).unwrap();
        assert!(battle.contains_key("Goblin"));
    }
}
