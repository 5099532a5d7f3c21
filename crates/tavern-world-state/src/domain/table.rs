//! Keyed sheet tables.
//!
//! A [`Table`] keeps rows in insertion order with a key index on the side.
//! Writes arrive as loosely-typed JSON patches from generation services;
//! [`Table::upsert_patch`] canonicalizes legacy field names, merges the patch
//! over the existing row, and decodes the result back into the typed row.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row key within a table.
pub type RowKey = String;

/// A row type storable in a [`Table`].
pub trait TableRow: Clone + Serialize + DeserializeOwned {
    /// Legacy field names accepted in patches, mapped to canonical names.
    const FIELD_ALIASES: &'static [(&'static str, &'static str)] = &[];

    /// Returns this row's key under `key_field`.
    fn row_key(&self, key_field: &str) -> Option<RowKey>;
}

/// Whether an upsert created or replaced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    /// A new row was appended.
    Inserted,
    /// An existing row was merged.
    Updated,
}

/// Outcome of a successful upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    /// Key of the affected row.
    pub key: RowKey,
    /// Insert or update.
    pub kind: UpsertKind,
}

/// Reads a JSON value as a row key. Strings are trimmed; integers are
/// rendered in decimal.
#[must_use]
pub fn key_from_value(value: &Value) -> Option<RowKey> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A keyed collection of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "TableRepr<R>",
    bound(serialize = "R: Serialize", deserialize = "R: TableRow")
)]
pub struct Table<R> {
    key_field: String,
    rows: Vec<R>,
    #[serde(skip)]
    index: HashMap<RowKey, usize>,
}

#[derive(Deserialize)]
struct TableRepr<R> {
    key_field: String,
    #[serde(default = "Vec::new")]
    rows: Vec<R>,
}

impl<R: TableRow> From<TableRepr<R>> for Table<R> {
    fn from(repr: TableRepr<R>) -> Self {
        let mut table = Self {
            key_field: repr.key_field,
            rows: repr.rows,
            index: HashMap::new(),
        };
        table.reindex();
        table
    }
}

impl<R: TableRow> Table<R> {
    /// Creates an empty table keyed by `key_field`.
    #[must_use]
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Creates a table from rows, dropping later duplicates of a key.
    #[must_use]
    pub fn from_rows(key_field: impl Into<String>, rows: Vec<R>) -> Self {
        let mut table = Self::new(key_field);
        for row in rows {
            table.insert(row);
        }
        table
    }

    /// The field rows are keyed by.
    #[must_use]
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order.
    #[must_use]
    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    /// Iterates rows in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, R> {
        self.rows.iter()
    }

    /// Looks up a row by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&R> {
        self.index.get(key).map(|&i| &self.rows[i])
    }

    /// Looks up a row by key for mutation.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut R> {
        self.index.get(key).map(|&i| &mut self.rows[i])
    }

    /// Whether a row with `key` exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Key of the row at `position`, if any.
    #[must_use]
    pub fn key_at(&self, position: usize) -> Option<RowKey> {
        self.rows.get(position)?.row_key(&self.key_field)
    }

    /// Inserts or replaces a typed row. Rows without a key are appended
    /// without being indexed.
    pub fn insert(&mut self, row: R) -> Option<RowKey> {
        let key = row.row_key(&self.key_field);
        match key.as_ref().and_then(|k| self.index.get(k)) {
            Some(&i) => self.rows[i] = row,
            None => {
                if let Some(k) = &key {
                    self.index.insert(k.clone(), self.rows.len());
                }
                self.rows.push(row);
            }
        }
        key
    }

    /// Removes a row by key.
    pub fn remove(&mut self, key: &str) -> Option<R> {
        let position = self.index.get(key).copied()?;
        let row = self.rows.remove(position);
        self.reindex();
        Some(row)
    }

    /// Removes a row by position.
    pub fn remove_at(&mut self, position: usize) -> Option<R> {
        if position >= self.rows.len() {
            return None;
        }
        let row = self.rows.remove(position);
        self.reindex();
        Some(row)
    }

    /// Keeps only rows matching the predicate. Returns the number removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&R) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| keep(row));
        self.reindex();
        before - self.rows.len()
    }

    /// Drops the oldest rows so that at most `max` remain.
    pub fn truncate_front(&mut self, max: usize) {
        if self.rows.len() > max {
            let excess = self.rows.len() - max;
            self.rows.drain(..excess);
            self.reindex();
        }
    }

    /// Returns the row serialized as a JSON object.
    #[must_use]
    pub fn row_value(&self, key: &str) -> Option<Map<String, Value>> {
        match serde_json::to_value(self.get(key)?) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    /// Reads the key a patch addresses, after alias canonicalization.
    #[must_use]
    pub fn patch_key(&self, patch: &Map<String, Value>) -> Option<RowKey> {
        patch.get(&self.key_field).and_then(key_from_value)
    }

    /// Rewrites legacy field names in a patch to their canonical names.
    /// A canonical name already present wins over its alias.
    #[must_use]
    pub fn canonicalize(&self, patch: &Map<String, Value>) -> Map<String, Value> {
        let mut out = Map::with_capacity(patch.len());
        for (field, value) in patch {
            let canonical = R::FIELD_ALIASES
                .iter()
                .find(|(alias, _)| alias == field)
                .map_or(field.as_str(), |(_, canonical)| *canonical);
            if canonical != field && patch.contains_key(canonical) {
                continue;
            }
            out.insert(canonical.to_owned(), value.clone());
        }
        out
    }

    /// Generates a key for an unkeyed row.
    #[must_use]
    pub fn generate_key(&self, prefix: &str) -> RowKey {
        let mut n = self.rows.len() + 1;
        loop {
            let candidate = format!("{prefix}_{n}");
            if !self.index.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Merges a JSON patch into the row it addresses, creating the row when
    /// absent. Patches without a key receive a generated `<prefix>_<n>` key.
    ///
    /// # Errors
    ///
    /// Returns the decoder error if the merged row does not fit `R`. The
    /// table is unchanged in that case.
    pub fn upsert_patch(
        &mut self,
        patch: &Map<String, Value>,
        generated_prefix: &str,
    ) -> Result<Upserted, serde_json::Error> {
        let mut patch = self.canonicalize(patch);
        let key = match self.patch_key(&patch) {
            Some(key) => key,
            None => {
                let key = self.generate_key(generated_prefix);
                patch.insert(self.key_field.clone(), Value::String(key.clone()));
                key
            }
        };

        match self.index.get(&key).copied() {
            Some(position) => {
                let mut merged = match serde_json::to_value(&self.rows[position])? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                for (field, value) in patch {
                    merged.insert(field, value);
                }
                let row: R = serde_json::from_value(Value::Object(merged))?;
                self.rows[position] = row;
                Ok(Upserted {
                    key,
                    kind: UpsertKind::Updated,
                })
            }
            None => {
                let row: R = serde_json::from_value(Value::Object(patch))?;
                self.index.insert(key.clone(), self.rows.len());
                self.rows.push(row);
                Ok(Upserted {
                    key,
                    kind: UpsertKind::Inserted,
                })
            }
        }
    }

    fn reindex(&mut self) {
        self.index = self
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| row.row_key(&self.key_field).map(|k| (k, i)))
            .collect();
    }
}

/// An untyped sheet row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SheetRow(pub Map<String, Value>);

impl TableRow for SheetRow {
    fn row_key(&self, key_field: &str) -> Option<RowKey> {
        self.0.get(key_field).and_then(key_from_value)
    }
}

/// Object-safe view over any table, used where a sheet id selects the
/// table at runtime.
pub trait SheetTable {
    /// The field rows are keyed by.
    fn key_field(&self) -> &str;

    /// Canonicalizes legacy field names of a patch.
    fn canonicalize(&self, patch: &Map<String, Value>) -> Map<String, Value>;

    /// Key a patch addresses.
    fn patch_key(&self, patch: &Map<String, Value>) -> Option<RowKey>;

    /// Merges a patch into the table.
    ///
    /// # Errors
    ///
    /// Returns the decoder error if the merged row is invalid.
    fn upsert(
        &mut self,
        patch: &Map<String, Value>,
        generated_prefix: &str,
    ) -> Result<Upserted, serde_json::Error>;

    /// Removes a row. Returns whether it existed.
    fn remove_key(&mut self, key: &str) -> bool;

    /// Current row as JSON.
    fn row_json(&self, key: &str) -> Option<Map<String, Value>>;

    /// Key of the row at a position.
    fn key_at(&self, position: usize) -> Option<RowKey>;

    /// Number of rows.
    fn row_count(&self) -> usize;
}

impl<R: TableRow> SheetTable for Table<R> {
    fn key_field(&self) -> &str {
        Table::key_field(self)
    }

    fn canonicalize(&self, patch: &Map<String, Value>) -> Map<String, Value> {
        Table::canonicalize(self, patch)
    }

    fn patch_key(&self, patch: &Map<String, Value>) -> Option<RowKey> {
        Table::patch_key(self, patch)
    }

    fn upsert(
        &mut self,
        patch: &Map<String, Value>,
        generated_prefix: &str,
    ) -> Result<Upserted, serde_json::Error> {
        self.upsert_patch(patch, generated_prefix)
    }

    fn remove_key(&mut self, key: &str) -> bool {
        self.remove(key).is_some()
    }

    fn row_json(&self, key: &str) -> Option<Map<String, Value>> {
        self.row_value(key)
    }

    fn key_at(&self, position: usize) -> Option<RowKey> {
        Table::key_at(self, position)
    }

    fn row_count(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Npc {
        npc_id: String,
        #[serde(default)]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        affinity: Option<i64>,
    }

    impl TableRow for Npc {
        const FIELD_ALIASES: &'static [(&'static str, &'static str)] =
            &[("NPC_ID", "npc_id"), ("id", "npc_id"), ("姓名", "name")];

        fn row_key(&self, _key_field: &str) -> Option<RowKey> {
            Some(self.npc_id.clone())
        }
    }

    fn patch(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_upsert_patch_inserts_new_row_with_aliases() {
        // Arrange
        let mut table: Table<Npc> = Table::new("npc_id");

        // Act
        let outcome = table
            .upsert_patch(&patch(json!({ "NPC_ID": "NPC_1", "姓名": "Aiz" })), "NPC")
            .unwrap();

        // Assert
        assert_eq!(outcome.kind, UpsertKind::Inserted);
        assert_eq!(outcome.key, "NPC_1");
        assert_eq!(table.get("NPC_1").unwrap().name, "Aiz");
    }

    #[test]
    fn test_upsert_patch_merges_into_existing_row() {
        // Arrange
        let mut table = Table::from_rows(
            "npc_id",
            vec![Npc {
                npc_id: "NPC_1".into(),
                name: "Aiz".into(),
                affinity: Some(10),
            }],
        );

        // Act
        let outcome = table
            .upsert_patch(&patch(json!({ "id": "NPC_1", "affinity": 25 })), "NPC")
            .unwrap();

        // Assert
        assert_eq!(outcome.kind, UpsertKind::Updated);
        let row = table.get("NPC_1").unwrap();
        assert_eq!(row.name, "Aiz");
        assert_eq!(row.affinity, Some(25));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_upsert_patch_rejects_invalid_row_without_mutating() {
        // Arrange
        let mut table = Table::from_rows(
            "npc_id",
            vec![Npc {
                npc_id: "NPC_1".into(),
                name: "Aiz".into(),
                affinity: None,
            }],
        );

        // Act
        let result = table.upsert_patch(&patch(json!({ "npc_id": "NPC_1", "affinity": "high" })), "NPC");

        // Assert
        assert!(result.is_err());
        assert_eq!(table.get("NPC_1").unwrap().affinity, None);
    }

    #[test]
    fn test_unkeyed_sheet_rows_get_generated_keys() {
        // Arrange
        let mut table: Table<SheetRow> = Table::new("id");

        // Act
        let first = table
            .upsert_patch(&patch(json!({ "headline": "Guild raid" })), "WORLD_News")
            .unwrap();
        let second = table
            .upsert_patch(&patch(json!({ "headline": "Festival" })), "WORLD_News")
            .unwrap();

        // Assert
        assert_eq!(first.key, "WORLD_News_1");
        assert_eq!(second.key, "WORLD_News_2");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_reindexes_remaining_rows() {
        // Arrange
        let mut table: Table<SheetRow> = Table::new("id");
        for id in ["a", "b", "c"] {
            table
                .upsert_patch(&patch(json!({ "id": id })), "X")
                .unwrap();
        }

        // Act
        table.remove("a");

        // Assert
        assert!(table.get("c").is_some());
        assert_eq!(table.key_at(0).as_deref(), Some("b"));
    }

    #[test]
    fn test_deserialized_table_rebuilds_index() {
        let json = json!({ "key_field": "id", "rows": [{ "id": "r1", "v": 1 }] });

        let table: Table<SheetRow> = serde_json::from_value(json).unwrap();

        assert!(table.contains_key("r1"));
    }

    #[test]
    fn test_truncate_front_drops_oldest() {
        let mut table: Table<SheetRow> = Table::new("id");
        for id in 0..5 {
            table.upsert_patch(&patch(json!({ "id": id })), "X").unwrap();
        }

        table.truncate_front(2);

        assert_eq!(table.len(), 2);
        assert!(table.contains_key("3"));
        assert!(table.contains_key("4"));
    }
}
