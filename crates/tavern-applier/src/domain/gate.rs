//! Admission of individual row writes.
//!
//! Every row a command touches is presented to a [`WriteGate`] through the
//! command's [`CommandWriter`]. The gate decides whether the write may
//! stand; the writer bumps the row version once it does. Handlers mutate
//! first and admit afterwards, so a rejected admission is undone together
//! with the rest of the command.

use serde_json::{Map, Value};
use tavern_core::error::DomainError;
use tavern_core::sheet::SheetId;
use tavern_world_state::domain::state::TableMeta;

/// Row key used for the player projection on `CHARACTER_Resources`.
pub const PLAYER_ROW: &str = "PLAYER";

/// Row key used for the scalar projection on `SYS_GlobalState`.
pub const GLOBAL_ROW: &str = "GLOBAL";

/// Row key used when a whole collection is replaced.
pub const ALL_ROWS: &str = "*";

/// Row field carrying the version a writer read.
pub const EXPECTED_VERSION_FIELD: &str = "_version";

/// A row about to be written.
#[derive(Debug, Clone, Copy)]
pub struct RowTouch<'a> {
    /// Target sheet.
    pub sheet: &'a SheetId,
    /// Target row.
    pub row_key: &'a str,
    /// Fields being written. Empty for deletions.
    pub fields: &'a Map<String, Value>,
    /// Version the writer read, if declared.
    pub expected_version: Option<u64>,
}

/// Decides whether writes may proceed.
pub trait WriteGate {
    /// Checks a sheet/field against the write scope.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::OutOfScopeWrite` when the write is not allowed.
    fn permits(&self, sheet: &SheetId, field: Option<&str>) -> Result<(), DomainError>;

    /// Checks whether money may move at all.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::OutOfScopeWrite` when it may not.
    fn permits_economy(&self) -> Result<(), DomainError>;

    /// Admits a row write against locks and earlier writes.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::VersionConflict` for fatal conflicts.
    fn admit(&mut self, touch: &RowTouch<'_>, meta: &mut TableMeta) -> Result<(), DomainError>;
}

/// A gate that admits every write.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl WriteGate for OpenGate {
    fn permits(&self, _sheet: &SheetId, _field: Option<&str>) -> Result<(), DomainError> {
        Ok(())
    }

    fn permits_economy(&self) -> Result<(), DomainError> {
        Ok(())
    }

    fn admit(&mut self, _touch: &RowTouch<'_>, _meta: &mut TableMeta) -> Result<(), DomainError> {
        Ok(())
    }
}

/// Side effects of one command that end up in the batch report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandEffects {
    /// Non-fatal oddities, e.g. a no-op `add`.
    pub warnings: Vec<String>,
    /// Ledger entries the command recorded.
    pub ledger_entries: Vec<String>,
}

/// Write channel for one command.
pub struct CommandWriter<'a> {
    gate: &'a mut dyn WriteGate,
    meta: &'a mut TableMeta,
    effects: CommandEffects,
}

impl<'a> CommandWriter<'a> {
    /// Opens a writer over a gate and the table bookkeeping.
    pub fn new(gate: &'a mut dyn WriteGate, meta: &'a mut TableMeta) -> Self {
        Self {
            gate,
            meta,
            effects: CommandEffects::default(),
        }
    }

    /// Scope-checks every field of a write, then admits it.
    ///
    /// # Errors
    ///
    /// Propagates scope and conflict rejections.
    pub fn admit(&mut self, touch: &RowTouch<'_>) -> Result<(), DomainError> {
        if touch.fields.is_empty() {
            self.gate.permits(touch.sheet, None)?;
        }
        for field in touch.fields.keys() {
            self.gate.permits(touch.sheet, Some(field))?;
        }
        self.track(touch)
    }

    /// Admits a write whose scope was already checked.
    ///
    /// # Errors
    ///
    /// Propagates conflict rejections.
    pub fn track(&mut self, touch: &RowTouch<'_>) -> Result<(), DomainError> {
        self.gate.admit(touch, self.meta)?;
        self.meta.bump_row_version(touch.sheet, touch.row_key);
        Ok(())
    }

    /// Checks that money may move.
    ///
    /// # Errors
    ///
    /// Propagates the gate's rejection.
    pub fn permits_economy(&self) -> Result<(), DomainError> {
        self.gate.permits_economy()
    }

    /// Records a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.effects.warnings.push(message.into());
    }

    /// Records a ledger entry id.
    pub fn note_ledger_entry(&mut self, ledger_id: String) {
        self.effects.ledger_entries.push(ledger_id);
    }

    /// Closes the writer.
    #[must_use]
    pub fn finish(self) -> CommandEffects {
        self.effects
    }
}

/// Removes and returns the declared expected version from a row patch.
pub fn take_expected_version(row: &mut Map<String, Value>) -> Option<u64> {
    row.remove(EXPECTED_VERSION_FIELD).and_then(|v| v.as_u64())
}

/// A single-field patch.
#[must_use]
pub fn field_patch(field: &str, value: Value) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(field.to_owned(), value);
    patch
}
