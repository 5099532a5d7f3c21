//! Batch application with per-command isolation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tavern_core::clock::Clock;
use tavern_core::command::{Action, Command, ServiceKey};
use tavern_core::error::DomainError;
use tavern_core::sheet::SheetId;
use tavern_rules::domain::invariants::{InvariantOptions, introduced_issues};
use tavern_rules::domain::scope::ScopePolicy;
use tavern_world_state::domain::derived::{raise_maximums, recompute_derived};
use tavern_world_state::domain::locks::{Conflict, ConflictPolicy, LockTracker, RowWrite};
use tavern_world_state::domain::paths::StatePath;
use tavern_world_state::domain::state::{GameState, TableMeta};
use tracing::{debug, info, instrument, warn};

use crate::domain::economy::{DEFAULT_LEDGER_CAP, EconomyContext, apply_econ_command};
use crate::domain::gate::{CommandEffects, CommandWriter, RowTouch, WriteGate};
use crate::domain::mutation::apply_path_command;
use crate::domain::report::{BatchReport, RejectedCommand, error_kind};
use crate::domain::sheets::{
    append_log_rows, apply_map_command, delete_sheet_rows, upsert_sheet_rows, upsert_typed_rows,
};

/// Applier tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplyOptions {
    /// Invariant validator settings.
    pub invariants: InvariantOptions,
    /// Conflict reasons that reject a write.
    pub conflict_policy: ConflictPolicy,
    /// Maximum ledger length.
    pub ledger_cap: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            invariants: InvariantOptions::default(),
            conflict_policy: ConflictPolicy::default(),
            ledger_cap: DEFAULT_LEDGER_CAP,
        }
    }
}

#[derive(Debug)]
struct PendingWrite {
    sheet: SheetId,
    row_key: String,
    fields: Map<String, Value>,
    expected_version: Option<u64>,
}

/// Gate backed by the scope policy and the turn's lock tracker. Writes are
/// buffered and only recorded in the tracker once the command is kept.
struct TrackedGate<'a> {
    scope: &'a ScopePolicy,
    tracker: &'a mut LockTracker,
    policy: &'a ConflictPolicy,
    writer: &'static str,
    memory_source: bool,
    conflicts: Vec<Conflict>,
    pending: Vec<PendingWrite>,
}

impl<'a> TrackedGate<'a> {
    fn new(
        scope: &'a ScopePolicy,
        tracker: &'a mut LockTracker,
        policy: &'a ConflictPolicy,
        source: ServiceKey,
    ) -> Self {
        Self {
            scope,
            tracker,
            policy,
            writer: source.as_str(),
            memory_source: source == ServiceKey::Memory,
            conflicts: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Records buffered writes when `keep` is set; returns every conflict
    /// seen either way.
    fn finish(self, keep: bool) -> Vec<Conflict> {
        if keep {
            for pending in &self.pending {
                self.tracker.record_write(&RowWrite {
                    sheet: &pending.sheet,
                    row_key: &pending.row_key,
                    writer: self.writer,
                    fields: &pending.fields,
                    expected_version: pending.expected_version,
                    memory_source: self.memory_source,
                });
            }
        }
        self.conflicts
    }
}

impl WriteGate for TrackedGate<'_> {
    fn permits(&self, sheet: &SheetId, field: Option<&str>) -> Result<(), DomainError> {
        self.scope.check(sheet, field)
    }

    fn permits_economy(&self) -> Result<(), DomainError> {
        self.scope.check_economy()
    }

    fn admit(&mut self, touch: &RowTouch<'_>, meta: &mut TableMeta) -> Result<(), DomainError> {
        let write = RowWrite {
            sheet: touch.sheet,
            row_key: touch.row_key,
            writer: self.writer,
            fields: touch.fields,
            expected_version: touch.expected_version,
            memory_source: self.memory_source,
        };
        let found = self.tracker.check_write(&write, meta);
        let fatal = self
            .policy
            .first_fatal(&found)
            .map(|conflict| DomainError::VersionConflict {
                sheet: conflict.sheet.to_string(),
                row_key: conflict.row_key.clone(),
                reason: conflict.reason.as_str().to_owned(),
            });
        self.conflicts.extend(found);
        if let Some(error) = fatal {
            return Err(error);
        }
        self.pending.push(PendingWrite {
            sheet: touch.sheet.clone(),
            row_key: touch.row_key.to_owned(),
            fields: touch.fields.clone(),
            expected_version: touch.expected_version,
        });
        Ok(())
    }
}

/// Whether the invariant validator must run after this command.
#[must_use]
pub fn is_invariant_sensitive(command: &Command) -> bool {
    if command.action.is_economic() {
        return true;
    }
    match &command.action {
        Action::Set | Action::Add | Action::Push | Action::Delete => command
            .key
            .as_deref()
            .and_then(|key| StatePath::parse(key).ok())
            .is_some_and(|path| path.is_invariant_sensitive()),
        Action::UpsertCharacter => true,
        Action::UpsertSheetRows => command.payload_sheet().is_some_and(|sheet| {
            matches!(
                SheetId::parse(sheet),
                SheetId::CharacterResources | SheetId::NpcRegistry | SheetId::EconLedger
            )
        }),
        _ => false,
    }
}

fn dispatch(
    state: &mut GameState,
    writer: &mut CommandWriter<'_>,
    ctx: &EconomyContext<'_>,
    command: &Command,
) -> Result<(), DomainError> {
    match &command.action {
        Action::Set | Action::Add | Action::Push | Action::Delete => {
            apply_path_command(state, writer, ctx, command)
        }
        Action::UpsertSheetRows => upsert_sheet_rows(state, writer, ctx, command),
        Action::DeleteSheetRows => delete_sheet_rows(state, writer, command),
        Action::UpsertCharacter | Action::UpsertInventory => {
            upsert_typed_rows(state, writer, command)
        }
        Action::ApplyEconDelta | Action::AppendEconLedger => {
            apply_econ_command(state, writer, ctx, command)
        }
        Action::AppendLogSummary | Action::AppendLogOutline => {
            append_log_rows(state, writer, command)
        }
        Action::UpsertExplorationMap | Action::SetMapVisuals | Action::UpsertBattleMapRows => {
            apply_map_command(state, writer, command)
        }
        Action::Other(name) => Err(DomainError::UnsupportedAction(name.clone())),
    }
}

fn apply_one(
    state: &mut GameState,
    gate: &mut TrackedGate<'_>,
    ctx: &EconomyContext<'_>,
    options: &ApplyOptions,
    command: &Command,
    before: &GameState,
) -> Result<CommandEffects, DomainError> {
    let mut meta = std::mem::take(&mut state.meta);
    let outcome = {
        let mut writer = CommandWriter::new(gate, &mut meta);
        dispatch(state, &mut writer, ctx, command).map(|()| writer.finish())
    };
    state.meta = meta;
    let effects = outcome?;

    if is_invariant_sensitive(command) {
        let mut projected = state.clone();
        raise_maximums(&mut projected);
        if let Some(issue) = introduced_issues(before, &projected, &options.invariants)
            .into_iter()
            .next()
        {
            return Err(issue.into());
        }
    }
    Ok(effects)
}

/// Applies commands in order. A failing command is rolled back on its own
/// and reported; the rest still apply. Derived fields are recomputed once
/// at the end.
#[instrument(skip_all, fields(turn = state.turn, commands = commands.len()))]
pub fn apply_batch(
    state: &mut GameState,
    commands: &[Command],
    scope: &ScopePolicy,
    tracker: &mut LockTracker,
    options: &ApplyOptions,
    clock: &dyn Clock,
) -> BatchReport {
    let mut report = BatchReport::default();
    for (index, command) in commands.iter().enumerate() {
        let ctx = EconomyContext {
            clock,
            ledger_cap: options.ledger_cap,
            source: command.source_service,
        };
        let before = state.clone();
        let mut gate = TrackedGate::new(
            scope,
            tracker,
            &options.conflict_policy,
            command.source_service,
        );
        let outcome = apply_one(state, &mut gate, &ctx, options, command, &before);
        let conflicts = gate.finish(outcome.is_ok());

        match outcome {
            Ok(effects) => {
                debug!(index, action = %command.action.as_str(), "command applied");
                report.applied += 1;
                report.ledger_entries.extend(effects.ledger_entries);
                report.warnings.extend(effects.warnings);
            }
            Err(error) => {
                *state = before;
                for conflict in &conflicts {
                    state.meta.conflict_stats.record(conflict.reason);
                }
                let kind = error_kind(&error);
                warn!(
                    index,
                    action = %command.action.as_str(),
                    source = %command.source_service,
                    reason = kind,
                    error = %error,
                    "command rejected"
                );
                report.rejected.push(RejectedCommand {
                    index,
                    action: command.action.as_str().to_owned(),
                    kind,
                    error: error.to_string(),
                });
            }
        }
        report.conflicts.extend(conflicts);
    }

    recompute_derived(state);
    info!(
        applied = report.applied,
        rejected = report.rejected.len(),
        conflicts = report.conflicts.len(),
        "batch applied"
    );
    report
}
