//! Typed payloads carried by sheet and economy actions.

use serde::Deserialize;
use serde_json::{Map, Value};
use tavern_core::command::Action;
use tavern_core::error::DomainError;
use tavern_core::sheet::SheetId;

fn malformed(action: &Action, detail: impl Into<String>) -> DomainError {
    DomainError::MalformedPayload {
        action: action.as_str().to_owned(),
        detail: detail.into(),
    }
}

fn one_or_many(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn object_rows(rows: Vec<Value>) -> Vec<Map<String, Value>> {
    rows.into_iter()
        .filter_map(|row| match row {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSheetPayload {
    #[serde(alias = "sheet_id", default)]
    sheet_id: String,
    #[serde(alias = "key_field", default)]
    key_field: Option<String>,
    #[serde(default)]
    rows: Vec<Value>,
    #[serde(alias = "row_ids", alias = "keys", default)]
    row_ids: Vec<Value>,
}

fn decode_sheet_payloads(
    action: &Action,
    value: &Value,
) -> Result<Vec<RawSheetPayload>, DomainError> {
    let payloads = one_or_many(value)
        .into_iter()
        .map(|item| {
            serde_json::from_value::<RawSheetPayload>(item.clone())
                .map_err(|e| malformed(action, e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if payloads.is_empty() {
        return Err(malformed(action, "empty payload list"));
    }
    for payload in &payloads {
        if payload.sheet_id.trim().is_empty() {
            return Err(malformed(action, "missing sheetId"));
        }
    }
    Ok(payloads)
}

/// Rows to upsert into one sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetUpsert {
    /// Target sheet.
    pub sheet_id: SheetId,
    /// Key field override.
    pub key_field: Option<String>,
    /// Row patches; non-object rows are dropped.
    pub rows: Vec<Map<String, Value>>,
}

/// Rows to delete from one sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetDelete {
    /// Target sheet.
    pub sheet_id: SheetId,
    /// Keys of the rows to delete.
    pub row_ids: Vec<String>,
}

/// Decodes an `upsert_sheet_rows` value: one payload or an array of them.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` when a payload has no sheet id
/// or no object rows.
pub fn sheet_upserts(action: &Action, value: &Value) -> Result<Vec<SheetUpsert>, DomainError> {
    decode_sheet_payloads(action, value)?
        .into_iter()
        .map(|payload| {
            let rows = object_rows(payload.rows);
            if rows.is_empty() {
                return Err(malformed(
                    action,
                    format!("no rows for {}", payload.sheet_id.trim()),
                ));
            }
            Ok(SheetUpsert {
                sheet_id: SheetId::parse(&payload.sheet_id),
                key_field: payload.key_field.filter(|k| !k.trim().is_empty()),
                rows,
            })
        })
        .collect()
}

/// Decodes a `delete_sheet_rows` value.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` when a payload has no sheet id
/// or no row ids.
pub fn sheet_deletes(action: &Action, value: &Value) -> Result<Vec<SheetDelete>, DomainError> {
    decode_sheet_payloads(action, value)?
        .into_iter()
        .map(|payload| {
            let row_ids: Vec<String> = payload.row_ids.iter().filter_map(row_id).collect();
            if row_ids.is_empty() {
                return Err(malformed(
                    action,
                    format!("no rowIds for {}", payload.sheet_id.trim()),
                ));
            }
            Ok(SheetDelete {
                sheet_id: SheetId::parse(&payload.sheet_id),
                row_ids,
            })
        })
        .collect()
}

fn row_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decodes row objects for row-oriented actions: a single object, an array
/// of objects, or `{rows: [...]}`.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` when no object rows are found.
pub fn payload_rows(
    action: &Action,
    value: &Value,
) -> Result<Vec<Map<String, Value>>, DomainError> {
    let rows = match value {
        Value::Object(map) => match map.get("rows") {
            Some(Value::Array(rows)) => object_rows(rows.clone()),
            _ => vec![map.clone()],
        },
        Value::Array(items) => object_rows(items.clone()),
        _ => Vec::new(),
    };
    if rows.is_empty() {
        return Err(malformed(action, "expected an object or an array of objects"));
    }
    Ok(rows)
}

/// A signed currency movement.
#[derive(Debug, Clone, PartialEq)]
pub struct EconDelta {
    /// Account name as written by the service.
    pub account: String,
    /// Signed amount.
    pub delta: f64,
    /// Why the money moved.
    pub reason: String,
    /// Reference to the originating command, if given.
    pub command_ref: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEconDelta {
    #[serde(default)]
    account: Option<String>,
    #[serde(alias = "amount", default)]
    delta: Value,
    #[serde(default)]
    reason: Option<String>,
    #[serde(alias = "command_ref", default)]
    command_ref: Option<String>,
}

/// Decodes an economy payload: one delta object or an array of them.
/// The account defaults to `character.currency`; numeric strings are
/// accepted as amounts.
///
/// # Errors
///
/// Returns `DomainError::MalformedPayload` when a delta is missing or not
/// a finite number.
pub fn econ_deltas(action: &Action, value: &Value) -> Result<Vec<EconDelta>, DomainError> {
    let items = one_or_many(value);
    if items.is_empty() {
        return Err(malformed(action, "empty payload list"));
    }
    items
        .into_iter()
        .map(|item| {
            let raw: RawEconDelta = serde_json::from_value(item.clone())
                .map_err(|e| malformed(action, e.to_string()))?;
            let delta = match &raw.delta {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|d| d.is_finite())
            .ok_or_else(|| malformed(action, "delta must be a finite number"))?;
            Ok(EconDelta {
                account: raw
                    .account
                    .filter(|a| !a.trim().is_empty())
                    .unwrap_or_else(|| "character.currency".to_owned()),
                delta,
                reason: raw.reason.unwrap_or_default(),
                command_ref: raw.command_ref,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sheet_upserts_accept_single_payload_with_snake_case() {
        // Act
        let upserts = sheet_upserts(
            &Action::UpsertSheetRows,
            &json!({ "sheet_id": "NPC_Registry", "key_field": "npc_id", "rows": [{ "npc_id": "A" }, 3] }),
        )
        .unwrap();

        // Assert
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].sheet_id, SheetId::NpcRegistry);
        assert_eq!(upserts[0].key_field.as_deref(), Some("npc_id"));
        assert_eq!(upserts[0].rows.len(), 1);
    }

    #[test]
    fn test_sheet_upserts_accept_payload_array() {
        let upserts = sheet_upserts(
            &Action::UpsertSheetRows,
            &json!([
                { "sheetId": "WORLD_News", "rows": [{ "headline": "a" }] },
                { "sheetId": "WORLD_Rumors", "rows": [{ "text": "b" }] }
            ]),
        )
        .unwrap();

        assert_eq!(upserts[1].sheet_id, SheetId::WorldRumors);
    }

    #[test]
    fn test_sheet_upserts_without_rows_are_malformed() {
        let result = sheet_upserts(&Action::UpsertSheetRows, &json!({ "sheetId": "WORLD_News" }));

        assert!(matches!(result, Err(DomainError::MalformedPayload { .. })));
    }

    #[test]
    fn test_sheet_deletes_accept_numeric_ids() {
        let deletes = sheet_deletes(
            &Action::DeleteSheetRows,
            &json!({ "sheetId": "LOG_Summary", "rowIds": [3, "4", ""] }),
        )
        .unwrap();

        assert_eq!(deletes[0].row_ids, vec!["3".to_owned(), "4".to_owned()]);
    }

    #[test]
    fn test_payload_rows_unwraps_rows_key() {
        let rows = payload_rows(
            &Action::UpsertCharacter,
            &json!({ "rows": [{ "name": "Aiz" }, { "name": "Bell" }] }),
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_econ_delta_defaults_account_and_parses_string_amount() {
        // Act
        let deltas = econ_deltas(
            &Action::ApplyEconDelta,
            &json!({ "amount": "-12.5", "reason": "bread" }),
        )
        .unwrap();

        // Assert
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].account, "character.currency");
        assert!((deltas[0].delta + 12.5).abs() < f64::EPSILON);
        assert_eq!(deltas[0].reason, "bread");
    }

    #[test]
    fn test_econ_delta_without_amount_is_malformed() {
        let result = econ_deltas(&Action::ApplyEconDelta, &json!({ "account": "familia.funds" }));

        match result {
            Err(DomainError::MalformedPayload { action, .. }) => {
                assert_eq!(action, "apply_econ_delta");
            }
            other => panic!("expected MalformedPayload, got {other:?}"),
        }
    }
}
