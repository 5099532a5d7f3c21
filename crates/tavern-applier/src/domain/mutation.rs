//! Path actions: `set`, `add`, `push` and `delete`.
//!
//! The command key is parsed into a [`StatePath`] once; every handler
//! matches on the parsed path.

use serde_json::{Map, Value};
use tavern_core::command::{Action, Command};
use tavern_core::error::{CommandField, DomainError};
use tavern_core::sheet::SheetId;
use tavern_world_state::domain::paths::{
    CharacterField, Collection, FamiliaField, RowSelector, StatePath, as_number,
};
use tavern_world_state::domain::state::{Account, GameState};
use tavern_world_state::domain::table::{RowKey, SheetTable, Table, TableRow};
use tracing::warn;

use super::economy::{EconomyContext, LedgerLine, record_ledger_entry, round_cents};
use super::gate::{
    ALL_ROWS, CommandWriter, GLOBAL_ROW, PLAYER_ROW, RowTouch, field_patch, take_expected_version,
};
use super::sheets::generated_prefix;

fn malformed(action: &Action, detail: impl Into<String>) -> DomainError {
    DomainError::MalformedPayload {
        action: action.as_str().to_owned(),
        detail: detail.into(),
    }
}

/// Renders a number as a JSON integer when it has no fractional part.
#[must_use]
pub fn number_value(n: f64) -> Value {
    if n.fract().abs() < f64::EPSILON && n.abs() < 9.0e15 {
        #[allow(clippy::cast_possible_truncation)]
        let whole = n as i64;
        Value::from(whole)
    } else {
        Value::from(n)
    }
}

fn text_value(action: &Action, value: &Value) -> Result<String, DomainError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(malformed(action, "expected a string")),
    }
}

fn items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn global_text<'s>(state: &'s mut GameState, path: &StatePath) -> Option<&'s mut String> {
    match path {
        StatePath::GameTime => Some(&mut state.game_time),
        StatePath::Location => Some(&mut state.location),
        StatePath::Weather => Some(&mut state.weather),
        _ => None,
    }
}

fn scalar_sheet_row(path: &StatePath) -> (SheetId, &'static str) {
    match path.sheet() {
        SheetId::CharacterResources => (SheetId::CharacterResources, PLAYER_ROW),
        sheet => (sheet, GLOBAL_ROW),
    }
}

fn touch_scalar(
    writer: &mut CommandWriter<'_>,
    path: &StatePath,
    value: Value,
) -> Result<(), DomainError> {
    let (sheet, row_key) = scalar_sheet_row(path);
    let field = path.field().unwrap_or_else(|| path.to_string());
    let fields = field_patch(&field, value);
    writer.admit(&RowTouch {
        sheet: &sheet,
        row_key,
        fields: &fields,
        expected_version: None,
    })
}

fn collection_table<'s>(
    state: &'s mut GameState,
    collection: Collection,
) -> Result<&'s mut dyn SheetTable, DomainError> {
    state
        .sheet_table_mut(&collection.sheet())
        .ok_or_else(|| DomainError::UnknownPath(collection.as_str().to_owned()))
}

fn resolve_row(
    table: &dyn SheetTable,
    row: &RowSelector,
    path: &StatePath,
) -> Result<RowKey, DomainError> {
    match row {
        RowSelector::Index(i) => table
            .key_at(*i)
            .ok_or_else(|| DomainError::UnknownPath(path.to_string())),
        RowSelector::Key(key) => Ok(key.clone()),
    }
}

/// Books an account movement caused by a path write.
fn record_account_move(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    account: Account,
    before: f64,
    reason: &str,
) {
    let after = state.balance(account);
    let delta = round_cents(after - before);
    if delta.abs() > 0.0 {
        let ledger_id = record_ledger_entry(
            state,
            ctx,
            &LedgerLine {
                account,
                before,
                delta,
                after,
                reason,
                command_ref: None,
            },
        );
        writer.note_ledger_entry(ledger_id);
    }
}

/// Upserts a patch into a collection row and admits it.
fn patch_entry(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    action: &Action,
    collection: Collection,
    row_key: &str,
    patch: Map<String, Value>,
) -> Result<(), DomainError> {
    let sheet = collection.sheet();
    let table = collection_table(state, collection)?;
    let mut patch = table.canonicalize(&patch);
    let expected = take_expected_version(&mut patch);
    patch.insert(table.key_field().to_owned(), Value::String(row_key.to_owned()));
    let upserted = table
        .upsert(&patch, generated_prefix(&sheet))
        .map_err(|e| malformed(action, e.to_string()))?;
    writer.admit(&RowTouch {
        sheet: &sheet,
        row_key: &upserted.key,
        fields: &patch,
        expected_version: expected,
    })
}

fn rebuild<R: TableRow>(
    table: &mut Table<R>,
    rows: &[Value],
    prefix: &str,
) -> Result<(), DomainError> {
    let mut fresh = Table::new(table.key_field().to_owned());
    for row in rows {
        let Value::Object(patch) = row else {
            return Err(malformed(&Action::Set, "collection rows must be objects"));
        };
        fresh
            .upsert_patch(patch, prefix)
            .map_err(|e| malformed(&Action::Set, e.to_string()))?;
    }
    *table = fresh;
    Ok(())
}

fn replace_collection(
    state: &mut GameState,
    collection: Collection,
    value: &Value,
) -> Result<(), DomainError> {
    let rows = value.as_array().ok_or_else(|| {
        malformed(
            &Action::Set,
            format!("{} expects an array", collection.as_str()),
        )
    })?;
    let prefix = generated_prefix(&collection.sheet());
    match collection {
        Collection::CombatLog => {
            state.combat.log = rows
                .iter()
                .map(|line| line.as_str().map_or_else(|| line.to_string(), str::to_owned))
                .collect();
            Ok(())
        }
        Collection::Inventory => rebuild(&mut state.inventory, rows, prefix),
        Collection::Registry => rebuild(&mut state.registry, rows, prefix),
        Collection::Interactions => rebuild(&mut state.interactions, rows, prefix),
        Collection::News => rebuild(&mut state.world.news, rows, prefix),
        Collection::Rumors => rebuild(&mut state.world.rumors, rows, prefix),
        Collection::PhoneMessages => rebuild(&mut state.phone.messages, rows, prefix),
        Collection::CombatEncounter => rebuild(&mut state.combat.encounter, rows, prefix),
    }
}

/// Assigns `value` at `path`.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` for values of the wrong shape,
/// `DomainError::Validation` for read-only fields, `DomainError::UnknownPath`
/// for rows that do not exist, and any scope or conflict rejection.
pub fn set_path(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    path: &StatePath,
    value: &Value,
) -> Result<(), DomainError> {
    match path {
        StatePath::GameTime | StatePath::Location | StatePath::Weather => {
            let text = text_value(&Action::Set, value)?;
            if let Some(slot) = global_text(state, path) {
                slot.clone_from(&text);
            }
            touch_scalar(writer, path, Value::String(text))
        }
        StatePath::CombatActive => {
            let active = match value {
                Value::Bool(b) => *b,
                Value::String(s) if s.eq_ignore_ascii_case("true") => true,
                Value::String(s) if s.eq_ignore_ascii_case("false") => false,
                _ => return Err(malformed(&Action::Set, "combat.active expects a boolean")),
            };
            state.combat.active = active;
            touch_scalar(writer, path, Value::Bool(active))
        }
        StatePath::Character(field) => {
            let account = path.account();
            let before = account.map(|a| state.balance(a));
            field.write(&mut state.character, value)?;
            if let (Some(account), Some(before)) = (account, before) {
                record_account_move(state, writer, ctx, account, before, &format!("set {path}"));
            }
            touch_scalar(writer, path, field.read(&state.character))
        }
        StatePath::Familia(FamiliaField::Name) => {
            state.familia.name = text_value(&Action::Set, value)?;
            touch_scalar(writer, path, Value::String(state.familia.name.clone()))
        }
        StatePath::Familia(FamiliaField::Funds) => {
            let funds = as_number(value)
                .ok_or_else(|| malformed(&Action::Set, "familia.funds expects a number"))?;
            let before = state.familia.funds;
            state.familia.funds = funds;
            record_account_move(
                state,
                writer,
                ctx,
                Account::FamiliaFunds,
                before,
                &format!("set {path}"),
            );
            touch_scalar(writer, path, Value::from(funds))
        }
        StatePath::Collection(collection) => {
            replace_collection(state, *collection, value)?;
            let sheet = collection.sheet();
            let fields = Map::new();
            writer.admit(&RowTouch {
                sheet: &sheet,
                row_key: ALL_ROWS,
                fields: &fields,
                expected_version: None,
            })
        }
        StatePath::Entry {
            collection: Collection::CombatLog,
            row,
            field,
        } => {
            let (RowSelector::Index(i), None) = (row, field) else {
                return Err(DomainError::UnknownPath(path.to_string()));
            };
            let text = text_value(&Action::Set, value)?;
            let line = state
                .combat
                .log
                .get_mut(*i)
                .ok_or_else(|| DomainError::UnknownPath(path.to_string()))?;
            line.clone_from(&text);
            touch_scalar(writer, path, Value::String(text))
        }
        StatePath::Entry {
            collection,
            row,
            field,
        } => {
            let row_key = resolve_row(collection_table(state, *collection)?, row, path)?;
            let patch = match field {
                Some(field) => field_patch(field, value.clone()),
                None => value
                    .as_object()
                    .cloned()
                    .ok_or_else(|| malformed(&Action::Set, "entry value must be an object"))?,
            };
            patch_entry(state, writer, &Action::Set, *collection, &row_key, patch)
        }
    }
}

fn add_path(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    path: &StatePath,
    value: &Value,
) -> Result<(), DomainError> {
    let delta = as_number(value).ok_or_else(|| malformed(&Action::Add, "value must be numeric"))?;
    match path {
        StatePath::Character(field) if *field != CharacterField::Name => {
            let current = as_number(&field.read(&state.character)).unwrap_or(0.0);
            let next = if path.account().is_some() {
                round_cents(current + delta)
            } else {
                current + delta
            };
            set_path(state, writer, ctx, path, &number_value(next))
        }
        StatePath::Familia(FamiliaField::Funds) => {
            let next = round_cents(state.familia.funds + delta);
            set_path(state, writer, ctx, path, &Value::from(next))
        }
        StatePath::Entry {
            collection,
            row,
            field: Some(field),
        } if *collection != Collection::CombatLog => {
            let table = collection_table(state, *collection)?;
            let row_key = resolve_row(table, row, path)?;
            let current = match table.row_json(&row_key).and_then(|r| r.get(field).cloned()) {
                None | Some(Value::Null) => Some(0.0),
                Some(existing) => as_number(&existing),
            };
            let Some(current) = current else {
                warn!(path = %path, "add target is not numeric; ignored");
                writer.warn(format!("add on non-numeric {path} ignored"));
                return Ok(());
            };
            let patch = field_patch(field, number_value(current + delta));
            patch_entry(state, writer, &Action::Add, *collection, &row_key, patch)
        }
        _ => {
            warn!(path = %path, "add target is not numeric; ignored");
            writer.warn(format!("add on non-numeric {path} ignored"));
            Ok(())
        }
    }
}

fn push_inventory(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    item: &Value,
) -> Result<(), DomainError> {
    let mut patch = match item {
        Value::Object(map) => state.inventory.canonicalize(map),
        Value::String(name) => field_patch("name", Value::String(name.clone())),
        _ => return Err(malformed(&Action::Push, "inventory items must be objects or names")),
    };
    let expected = take_expected_version(&mut patch);
    let incoming = patch.get("quantity").and_then(Value::as_i64).unwrap_or(1);
    let has_id = state.inventory.patch_key(&patch).is_some();
    let same_name = patch
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .and_then(|name| state.inventory.iter().find(|item| item.name.trim() == name))
        .map(|item| (item.item_id.clone(), item.quantity));
    if !has_id && let Some((item_id, quantity)) = same_name {
        patch.insert("item_id".to_owned(), Value::String(item_id));
        patch.insert("quantity".to_owned(), Value::from(quantity + incoming));
    }
    let sheet = SheetId::ItemInventory;
    let upserted = state
        .inventory
        .upsert_patch(&patch, generated_prefix(&sheet))
        .map_err(|e| malformed(&Action::Push, e.to_string()))?;
    writer.admit(&RowTouch {
        sheet: &sheet,
        row_key: &upserted.key,
        fields: &patch,
        expected_version: expected,
    })
}

fn push_path(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    path: &StatePath,
    value: &Value,
) -> Result<(), DomainError> {
    let StatePath::Collection(collection) = path else {
        return Err(DomainError::Validation(format!(
            "push target {path} is not a collection"
        )));
    };
    match collection {
        Collection::CombatLog => {
            for line in items(value) {
                let text = text_value(&Action::Push, line)?;
                state.combat.log.push(text);
            }
            touch_scalar(writer, path, value.clone())
        }
        Collection::Inventory => {
            for item in items(value) {
                push_inventory(state, writer, item)?;
            }
            Ok(())
        }
        _ => {
            let sheet = collection.sheet();
            for item in items(value) {
                let Value::Object(row) = item else {
                    return Err(malformed(&Action::Push, "pushed rows must be objects"));
                };
                let mut row = row.clone();
                let expected = take_expected_version(&mut row);
                let table = collection_table(state, *collection)?;
                let patch = table.canonicalize(&row);
                let upserted = table
                    .upsert(&patch, generated_prefix(&sheet))
                    .map_err(|e| malformed(&Action::Push, e.to_string()))?;
                writer.admit(&RowTouch {
                    sheet: &sheet,
                    row_key: &upserted.key,
                    fields: &patch,
                    expected_version: expected,
                })?;
            }
            Ok(())
        }
    }
}

fn delete_path(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    path: &StatePath,
    value: &Value,
) -> Result<(), DomainError> {
    match path {
        StatePath::Collection(collection) => {
            let row = match value {
                Value::Number(n) => n
                    .as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .map(RowSelector::Index),
                Value::String(key) if !key.trim().is_empty() => {
                    Some(RowSelector::Key(key.trim().to_owned()))
                }
                _ => None,
            }
            .ok_or_else(|| {
                DomainError::Validation(format!("delete on {path} needs a key or an index"))
            })?;
            let entry = StatePath::Entry {
                collection: *collection,
                row,
                field: None,
            };
            delete_path(state, writer, &entry, &Value::Null)
        }
        StatePath::Entry {
            collection: Collection::CombatLog,
            row,
            field,
        } => {
            let (RowSelector::Index(i), None) = (row, field) else {
                return Err(DomainError::UnknownPath(path.to_string()));
            };
            if *i >= state.combat.log.len() {
                writer.warn(format!("delete target {path} not found"));
                return Ok(());
            }
            state.combat.log.remove(*i);
            touch_scalar(writer, path, Value::Null)
        }
        StatePath::Entry {
            collection,
            row,
            field,
        } => {
            let table = collection_table(state, *collection)?;
            let row_key = match row {
                RowSelector::Index(i) => table.key_at(*i),
                RowSelector::Key(key) => Some(key.clone()),
            }
            .filter(|key| table.row_json(key).is_some());
            let Some(row_key) = row_key else {
                warn!(path = %path, "delete target not found");
                writer.warn(format!("delete target {path} not found"));
                return Ok(());
            };
            match field {
                Some(field) => patch_entry(
                    state,
                    writer,
                    &Action::Delete,
                    *collection,
                    &row_key,
                    field_patch(field, Value::Null),
                ),
                None => {
                    table.remove_key(&row_key);
                    let sheet = collection.sheet();
                    let fields = Map::new();
                    writer.admit(&RowTouch {
                        sheet: &sheet,
                        row_key: &row_key,
                        fields: &fields,
                        expected_version: None,
                    })
                }
            }
        }
        _ => Err(DomainError::Validation(format!("{path} cannot be deleted"))),
    }
}

/// Executes a path action.
///
/// # Errors
///
/// Returns `DomainError::MalformedCommand` without a key,
/// `DomainError::UnknownPath` for unresolvable keys, and whatever the
/// action handler rejects.
pub fn apply_path_command(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    command: &Command,
) -> Result<(), DomainError> {
    let key = command
        .key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
        .ok_or(DomainError::MalformedCommand {
            missing: CommandField::Key,
        })?;
    let path = StatePath::parse(key)?;
    match &command.action {
        Action::Set => set_path(state, writer, ctx, &path, &command.value),
        Action::Add => add_path(state, writer, ctx, &path, &command.value),
        Action::Push => push_path(state, writer, &path, &command.value),
        Action::Delete => delete_path(state, writer, &path, &command.value),
        other => Err(DomainError::UnsupportedAction(other.as_str().to_owned())),
    }
}
