//! Row and cell lock tracking with conflict statistics.
//!
//! A [`LockTracker`] lives for exactly one turn. It remembers which writer
//! touched which row, so that sequential writes by the same writer and
//! writes to different rows never count as conflicts, while two writers
//! disagreeing about the same cell do.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tavern_core::sheet::SheetId;
use tracing::warn;

use super::state::TableMeta;
use super::table::RowKey;

/// Granularity of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    /// The whole row.
    Row,
    /// One field of a row.
    Cell,
}

/// An advisory lock held for the current turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Row or cell.
    pub scope: LockScope,
    /// Locked sheet.
    pub sheet: SheetId,
    /// Locked row.
    pub row_key: RowKey,
    /// Locked field for cell locks.
    pub field: Option<String>,
    /// Turn the lock belongs to.
    pub owner_turn: u32,
    /// Writer holding the lock.
    pub owner: String,
}

/// Why a write was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// A non-memory writer targeted a memory-owned sheet.
    SourceNotAllowed,
    /// Two writers set the same cell to different values this turn.
    ConcurrentRowWrite,
    /// The row is locked by another writer.
    RowLocked,
    /// The cell is locked by another writer.
    CellLocked,
    /// The writer's expected version predates the turn-start version.
    StaleVersion,
}

impl ConflictReason {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceNotAllowed => "source_not_allowed",
            Self::ConcurrentRowWrite => "concurrent_row_write",
            Self::RowLocked => "row_locked",
            Self::CellLocked => "cell_locked",
            Self::StaleVersion => "stale_version",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Reason code.
    pub reason: ConflictReason,
    /// Target sheet.
    pub sheet: SheetId,
    /// Target row.
    pub row_key: RowKey,
    /// Target field, when the conflict is cell-level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The writer whose write was flagged.
    pub writer: String,
    /// The writer already holding the row/cell, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

/// Conflict counters aggregated by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictStats {
    /// Total conflicts.
    pub total: u64,
    /// Conflicts per reason.
    pub by_reason: BTreeMap<ConflictReason, u64>,
}

impl ConflictStats {
    /// Counts one conflict.
    pub fn record(&mut self, reason: ConflictReason) {
        self.total += 1;
        *self.by_reason.entry(reason).or_insert(0) += 1;
    }

    /// Count for one reason.
    #[must_use]
    pub fn count(&self, reason: ConflictReason) -> u64 {
        self.by_reason.get(&reason).copied().unwrap_or(0)
    }
}

/// Which conflict reasons reject the write instead of letting the last
/// writer win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    /// Reasons that reject the write.
    pub fatal: BTreeSet<ConflictReason>,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            fatal: BTreeSet::from([
                ConflictReason::SourceNotAllowed,
                ConflictReason::RowLocked,
                ConflictReason::CellLocked,
            ]),
        }
    }
}

impl ConflictPolicy {
    /// Returns the first fatal conflict, if any.
    #[must_use]
    pub fn first_fatal<'a>(&self, conflicts: &'a [Conflict]) -> Option<&'a Conflict> {
        conflicts.iter().find(|c| self.fatal.contains(&c.reason))
    }
}

/// A pending row write.
#[derive(Debug, Clone)]
pub struct RowWrite<'a> {
    /// Target sheet.
    pub sheet: &'a SheetId,
    /// Target row.
    pub row_key: &'a str,
    /// Writer identity.
    pub writer: &'a str,
    /// Fields being written.
    pub fields: &'a Map<String, Value>,
    /// Version the writer read, if it declared one.
    pub expected_version: Option<u64>,
    /// Whether the writer is the memory service.
    pub memory_source: bool,
}

#[derive(Debug, Clone)]
struct TouchedRow {
    writer: String,
    fields: Map<String, Value>,
}

type RowSlot = (SheetId, RowKey);

/// Per-turn lock and write tracker.
#[derive(Debug, Default)]
pub struct LockTracker {
    turn: u32,
    row_locks: HashMap<RowSlot, Lock>,
    cell_locks: HashMap<(SheetId, RowKey, String), Lock>,
    touched: HashMap<RowSlot, TouchedRow>,
    baseline: HashMap<RowSlot, u64>,
}

impl LockTracker {
    /// Starts tracking a turn with no locks held.
    #[must_use]
    pub fn begin_turn(turn: u32) -> Self {
        Self {
            turn,
            ..Self::default()
        }
    }

    /// The turn being tracked.
    #[must_use]
    pub fn turn(&self) -> u32 {
        self.turn
    }

    /// Takes a row lock.
    ///
    /// # Errors
    ///
    /// Returns a `RowLocked` conflict if another writer holds the row.
    pub fn lock_row(
        &mut self,
        sheet: &SheetId,
        row_key: &str,
        owner: &str,
    ) -> Result<(), Conflict> {
        let slot = (sheet.clone(), row_key.to_owned());
        if let Some(existing) = self.row_locks.get(&slot) {
            if existing.owner != owner {
                return Err(Conflict {
                    reason: ConflictReason::RowLocked,
                    sheet: sheet.clone(),
                    row_key: row_key.to_owned(),
                    field: None,
                    writer: owner.to_owned(),
                    holder: Some(existing.owner.clone()),
                });
            }
            return Ok(());
        }
        self.row_locks.insert(
            slot,
            Lock {
                scope: LockScope::Row,
                sheet: sheet.clone(),
                row_key: row_key.to_owned(),
                field: None,
                owner_turn: self.turn,
                owner: owner.to_owned(),
            },
        );
        Ok(())
    }

    /// Takes a cell lock.
    ///
    /// # Errors
    ///
    /// Returns a `CellLocked` conflict if another writer holds the cell.
    pub fn lock_cell(
        &mut self,
        sheet: &SheetId,
        row_key: &str,
        field: &str,
        owner: &str,
    ) -> Result<(), Conflict> {
        let slot = (sheet.clone(), row_key.to_owned(), field.to_owned());
        if let Some(existing) = self.cell_locks.get(&slot) {
            if existing.owner != owner {
                return Err(Conflict {
                    reason: ConflictReason::CellLocked,
                    sheet: sheet.clone(),
                    row_key: row_key.to_owned(),
                    field: Some(field.to_owned()),
                    writer: owner.to_owned(),
                    holder: Some(existing.owner.clone()),
                });
            }
            return Ok(());
        }
        self.cell_locks.insert(
            slot,
            Lock {
                scope: LockScope::Cell,
                sheet: sheet.clone(),
                row_key: row_key.to_owned(),
                field: Some(field.to_owned()),
                owner_turn: self.turn,
                owner: owner.to_owned(),
            },
        );
        Ok(())
    }

    /// Locks currently held.
    #[must_use]
    pub fn held_locks(&self) -> Vec<&Lock> {
        self.row_locks.values().chain(self.cell_locks.values()).collect()
    }

    /// Checks a write against locks, source ownership, versions and earlier
    /// writes in this turn. Every conflict found is counted in
    /// `meta.conflict_stats`.
    pub fn check_write(&mut self, write: &RowWrite<'_>, meta: &mut TableMeta) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        let slot = (write.sheet.clone(), write.row_key.to_owned());
        let conflict = |reason, field: Option<&str>, holder: Option<&str>| Conflict {
            reason,
            sheet: write.sheet.clone(),
            row_key: write.row_key.to_owned(),
            field: field.map(str::to_owned),
            writer: write.writer.to_owned(),
            holder: holder.map(str::to_owned),
        };

        if write.sheet.is_memory_owned() && !write.memory_source {
            conflicts.push(conflict(ConflictReason::SourceNotAllowed, None, None));
        }

        if let Some(lock) = self.row_locks.get(&slot)
            && lock.owner != write.writer
        {
            conflicts.push(conflict(ConflictReason::RowLocked, None, Some(&lock.owner)));
        }

        for field in write.fields.keys() {
            let cell = (write.sheet.clone(), write.row_key.to_owned(), field.clone());
            if let Some(lock) = self.cell_locks.get(&cell)
                && lock.owner != write.writer
            {
                conflicts.push(conflict(
                    ConflictReason::CellLocked,
                    Some(field),
                    Some(&lock.owner),
                ));
            }
        }

        let baseline = *self
            .baseline
            .entry(slot.clone())
            .or_insert_with(|| meta.row_version(write.sheet, write.row_key));
        if let Some(expected) = write.expected_version
            && expected < baseline
        {
            conflicts.push(conflict(ConflictReason::StaleVersion, None, None));
        }

        if let Some(previous) = self.touched.get(&slot)
            && previous.writer != write.writer
            && let Some((field, _)) = write.fields.iter().find(|(field, value)| {
                previous
                    .fields
                    .get(*field)
                    .is_some_and(|earlier| earlier != *value)
            })
        {
            conflicts.push(conflict(
                ConflictReason::ConcurrentRowWrite,
                Some(field),
                Some(&previous.writer),
            ));
        }

        for c in &conflicts {
            warn!(
                sheet = %c.sheet,
                row_key = %c.row_key,
                reason = %c.reason,
                writer = %c.writer,
                "write conflict recorded"
            );
            meta.conflict_stats.record(c.reason);
        }
        conflicts
    }

    /// Records a write that was applied.
    pub fn record_write(&mut self, write: &RowWrite<'_>) {
        let slot = (write.sheet.clone(), write.row_key.to_owned());
        let entry = self.touched.entry(slot).or_insert_with(|| TouchedRow {
            writer: write.writer.to_owned(),
            fields: Map::new(),
        });
        entry.writer = write.writer.to_owned();
        for (field, value) in write.fields {
            entry.fields.insert(field.clone(), value.clone());
        }
    }

    /// Releases every lock and forgets the turn's writes.
    pub fn end_turn(&mut self) {
        self.row_locks.clear();
        self.cell_locks.clear();
        self.touched.clear();
        self.baseline.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    fn write<'a>(
        sheet: &'a SheetId,
        row_key: &'a str,
        writer: &'a str,
        fields: &'a Map<String, Value>,
    ) -> RowWrite<'a> {
        RowWrite {
            sheet,
            row_key,
            writer,
            fields,
            expected_version: None,
            memory_source: false,
        }
    }

    #[test]
    fn test_different_rows_never_conflict() {
        // Arrange
        let mut tracker = LockTracker::begin_turn(3);
        let mut meta = TableMeta::default();
        let sheet = SheetId::NpcRegistry;
        let a = fields(json!({ "affinity": 10 }));
        let b = fields(json!({ "affinity": 90 }));

        // Act
        let first = tracker.check_write(&write(&sheet, "NPC_1", "state", &a), &mut meta);
        tracker.record_write(&write(&sheet, "NPC_1", "state", &a));
        let second = tracker.check_write(&write(&sheet, "NPC_2", "npc-fallback", &b), &mut meta);

        // Assert
        assert!(first.is_empty());
        assert!(second.is_empty());
        assert_eq!(meta.conflict_stats.total, 0);
    }

    #[test]
    fn test_same_writer_sequential_overwrite_is_not_a_conflict() {
        let mut tracker = LockTracker::begin_turn(3);
        let mut meta = TableMeta::default();
        let sheet = SheetId::NpcRegistry;
        let a = fields(json!({ "affinity": 10 }));
        let b = fields(json!({ "affinity": 20 }));

        tracker.record_write(&write(&sheet, "NPC_1", "state", &a));
        let conflicts = tracker.check_write(&write(&sheet, "NPC_1", "state", &b), &mut meta);

        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_two_writers_disagreeing_on_a_cell_conflict() {
        // Arrange
        let mut tracker = LockTracker::begin_turn(3);
        let mut meta = TableMeta::default();
        let sheet = SheetId::NpcRegistry;
        let a = fields(json!({ "affinity": 10, "location": "Guild" }));
        let b = fields(json!({ "affinity": 40 }));
        tracker.record_write(&write(&sheet, "NPC_1", "state", &a));

        // Act
        let conflicts = tracker.check_write(&write(&sheet, "NPC_1", "phone", &b), &mut meta);

        // Assert
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].reason, ConflictReason::ConcurrentRowWrite);
        assert_eq!(conflicts[0].field.as_deref(), Some("affinity"));
        assert_eq!(meta.conflict_stats.count(ConflictReason::ConcurrentRowWrite), 1);
    }

    #[test]
    fn test_two_writers_agreeing_on_a_cell_do_not_conflict() {
        let mut tracker = LockTracker::begin_turn(3);
        let mut meta = TableMeta::default();
        let sheet = SheetId::NpcRegistry;
        let a = fields(json!({ "present": true }));
        tracker.record_write(&write(&sheet, "NPC_1", "state", &a));

        let conflicts = tracker.check_write(&write(&sheet, "NPC_1", "phone", &a), &mut meta);

        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_memory_owned_sheet_rejects_other_sources() {
        let mut tracker = LockTracker::begin_turn(1);
        let mut meta = TableMeta::default();
        let sheet = SheetId::LogSummary;
        let row = fields(json!({ "summary": "x" }));

        let conflicts = tracker.check_write(&write(&sheet, "1", "state", &row), &mut meta);

        assert_eq!(conflicts[0].reason, ConflictReason::SourceNotAllowed);
        assert!(ConflictPolicy::default().first_fatal(&conflicts).is_some());
    }

    #[test]
    fn test_expected_version_compares_against_turn_start() {
        // Arrange
        let mut tracker = LockTracker::begin_turn(5);
        let mut meta = TableMeta::default();
        let sheet = SheetId::NpcRegistry;
        meta.bump_row_version(&sheet, "NPC_1");
        let a = fields(json!({ "location": "Guild" }));
        let b = fields(json!({ "affinity": 5 }));
        let mut first = write(&sheet, "NPC_1", "state", &a);
        first.expected_version = Some(1);

        // Act
        assert!(tracker.check_write(&first, &mut meta).is_empty());
        tracker.record_write(&first);
        meta.bump_row_version(&sheet, "NPC_1");
        let mut second = write(&sheet, "NPC_1", "phone", &b);
        second.expected_version = Some(1);
        let conflicts = tracker.check_write(&second, &mut meta);

        // Assert
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_stale_expected_version_is_flagged() {
        let mut tracker = LockTracker::begin_turn(5);
        let mut meta = TableMeta::default();
        let sheet = SheetId::NpcRegistry;
        meta.bump_row_version(&sheet, "NPC_1");
        meta.bump_row_version(&sheet, "NPC_1");
        let a = fields(json!({ "location": "Guild" }));
        let mut stale = write(&sheet, "NPC_1", "state", &a);
        stale.expected_version = Some(1);

        let conflicts = tracker.check_write(&stale, &mut meta);

        assert_eq!(conflicts[0].reason, ConflictReason::StaleVersion);
        assert!(ConflictPolicy::default().first_fatal(&conflicts).is_none());
    }

    #[test]
    fn test_row_lock_blocks_other_owner_until_turn_ends() {
        // Arrange
        let mut tracker = LockTracker::begin_turn(2);
        let mut meta = TableMeta::default();
        let sheet = SheetId::LogOutline;
        tracker.lock_row(&sheet, "2", "memory").unwrap();
        let row = fields(json!({ "outline": "y" }));
        let mut other = write(&sheet, "2", "memory-repair", &row);
        other.memory_source = true;

        // Act
        let locked = tracker.check_write(&other, &mut meta);
        tracker.end_turn();
        let released = tracker.check_write(&other, &mut meta);

        // Assert
        assert_eq!(locked[0].reason, ConflictReason::RowLocked);
        assert!(released.is_empty());
        assert!(tracker.held_locks().is_empty());
    }

    #[test]
    fn test_cell_lock_conflict_reports_holder() {
        let mut tracker = LockTracker::begin_turn(2);
        let sheet = SheetId::NpcRegistry;
        tracker.lock_cell(&sheet, "NPC_1", "affinity", "state").unwrap();

        let err = tracker
            .lock_cell(&sheet, "NPC_1", "affinity", "phone")
            .unwrap_err();

        assert_eq!(err.reason, ConflictReason::CellLocked);
        assert_eq!(err.holder.as_deref(), Some("state"));
    }
}
