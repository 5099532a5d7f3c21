//! Summary/outline pairing.
//!
//! Every turn should have one summary row and one outline row, carrying
//! the same AM-code or none at all. This module detects broken pairs,
//! aligns codes, collapses duplicate rows returned by the memory service,
//! and purges a turn's rows before a reroll rewrites them.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{Map, Value};
use tavern_commands::domain::payloads::{payload_rows, sheet_upserts};
use tavern_core::command::{Action, Command, ServiceKey};
use tavern_core::sheet::SheetId;
use tavern_world_state::domain::rows::{OutlineRow, SummaryRow};
use tavern_world_state::domain::state::GameState;
use tavern_world_state::domain::table::{Table, TableRow};
use tracing::debug;

use super::am_index::{AmCode, next_am_code};

/// Texts that stand in for content the service did not produce.
const PLACEHOLDERS: &[&str] = &[
    "...",
    "…",
    "……",
    "待补",
    "待补充",
    "placeholder",
    "tbd",
    "n/a",
    "none",
];

/// Whether a text is empty or a known placeholder.
#[must_use]
pub fn is_placeholder(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty()
        || PLACEHOLDERS
            .iter()
            .any(|placeholder| trimmed.eq_ignore_ascii_case(placeholder))
}

/// What is wrong with a turn's pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PairingIssueKind {
    /// A summary row has no outline row.
    MissingOutline,
    /// An outline row has no summary row.
    MissingSummary,
    /// Both rows exist with different codes, or only one carries a code.
    CodeMismatch {
        /// Code on the summary row.
        summary: Option<String>,
        /// Code on the outline row.
        outline: Option<String>,
    },
    /// Both rows agree on a code an earlier turn already carries.
    DuplicateCode {
        /// The shared code.
        code: String,
        /// Earliest turn carrying the code.
        first_turn: u32,
    },
}

/// A broken pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingIssue {
    /// Turn of the pair.
    pub turn: u32,
    /// What is wrong.
    #[serde(flatten)]
    pub kind: PairingIssueKind,
}

impl PairingIssue {
    /// The sheet whose row is missing, for issues a fill request can
    /// repair.
    #[must_use]
    pub fn missing_sheet(&self) -> Option<SheetId> {
        match self.kind {
            PairingIssueKind::MissingOutline => Some(SheetId::LogOutline),
            PairingIssueKind::MissingSummary => Some(SheetId::LogSummary),
            PairingIssueKind::CodeMismatch { .. } | PairingIssueKind::DuplicateCode { .. } => None,
        }
    }
}

fn normalized_code(code: Option<&str>) -> Option<String> {
    code.map(|c| AmCode::parse(c).map_or_else(|| c.trim().to_owned(), |am| am.to_string()))
        .filter(|c| !c.is_empty())
}

/// Lists every broken pair, ordered by turn.
#[must_use]
pub fn check_pairing(state: &GameState) -> Vec<PairingIssue> {
    let mut turns: BTreeMap<u32, (Option<&SummaryRow>, Option<&OutlineRow>)> = BTreeMap::new();
    for row in state.summaries.iter() {
        turns.entry(row.turn).or_default().0 = Some(row);
    }
    for row in state.outlines.iter() {
        turns.entry(row.turn).or_default().1 = Some(row);
    }

    let mut first_turn: BTreeMap<String, u32> = BTreeMap::new();
    let codes = state
        .summaries
        .iter()
        .map(|row| (row.turn, row.am_code.as_deref()))
        .chain(state.outlines.iter().map(|row| (row.turn, row.am_code.as_deref())));
    for (turn, code) in codes {
        if let Some(code) = normalized_code(code) {
            first_turn
                .entry(code)
                .and_modify(|first| *first = (*first).min(turn))
                .or_insert(turn);
        }
    }

    turns
        .into_iter()
        .filter_map(|(turn, pair)| {
            let kind = match pair {
                (Some(_), None) => PairingIssueKind::MissingOutline,
                (None, Some(_)) => PairingIssueKind::MissingSummary,
                (Some(summary), Some(outline)) => {
                    let summary = normalized_code(summary.am_code.as_deref());
                    let outline = normalized_code(outline.am_code.as_deref());
                    if summary != outline {
                        PairingIssueKind::CodeMismatch { summary, outline }
                    } else if let Some(code) = summary
                        && let Some(first) = first_turn.get(&code).copied()
                        && first < turn
                    {
                        PairingIssueKind::DuplicateCode {
                            code,
                            first_turn: first,
                        }
                    } else {
                        return None;
                    }
                }
                (None, None) => return None,
            };
            Some(PairingIssue { turn, kind })
        })
        .collect()
}

fn pair_codes(state: &GameState, key: &str) -> (Option<AmCode>, Option<AmCode>) {
    let summary = state.summaries.get(key).and_then(|row| row.am_code.as_deref());
    let outline = state.outlines.get(key).and_then(|row| row.am_code.as_deref());
    (summary.and_then(AmCode::parse), outline.and_then(AmCode::parse))
}

/// Makes both rows of every complete pair carry the same AM-code, unique
/// across turns.
///
/// Pairs are visited by turn. A pair whose rows already agree on a code no
/// earlier pair holds keeps it. Every other pair receives the code after
/// the highest one in use, which is the only code a row may offer and keep.
/// Codes on rows without a partner count as in use. Returns the turns that
/// changed.
pub fn align_codes(state: &mut GameState) -> Vec<u32> {
    let turns: BTreeSet<u32> = state
        .summaries
        .iter()
        .map(|row| row.turn)
        .filter(|turn| state.outlines.contains_key(&turn.to_string()))
        .collect();

    let mut in_use = BTreeSet::new();
    let mut pending = Vec::new();
    for &turn in &turns {
        match pair_codes(state, &turn.to_string()) {
            (Some(summary), Some(outline)) if summary == outline && !in_use.contains(&summary) => {
                in_use.insert(summary);
            }
            _ => pending.push(turn),
        }
    }
    let unpaired = state
        .summaries
        .iter()
        .filter(|row| !turns.contains(&row.turn))
        .filter_map(|row| row.am_code.as_deref())
        .chain(
            state
                .outlines
                .iter()
                .filter(|row| !turns.contains(&row.turn))
                .filter_map(|row| row.am_code.as_deref()),
        )
        .filter_map(AmCode::parse);
    in_use.extend(unpaired);

    for &turn in &pending {
        let key = turn.to_string();
        let code = next_am_code(in_use.iter().copied());
        in_use.insert(code);
        let code = code.to_string();
        if let Some(row) = state.summaries.get_mut(&key) {
            row.am_code = Some(code.clone());
        }
        if let Some(row) = state.outlines.get_mut(&key) {
            row.am_code = Some(code);
        }
        state.meta.bump_row_version(&SheetId::LogSummary, &key);
        state.meta.bump_row_version(&SheetId::LogOutline, &key);
    }
    if !pending.is_empty() {
        debug!(turns = ?pending, "AM-codes aligned");
    }
    pending
}

/// Removes a turn's summary and outline rows. Returns how many were
/// removed.
pub fn purge_turn(state: &mut GameState, turn: u32) -> usize {
    let key = turn.to_string();
    let removed = usize::from(state.summaries.remove(&key).is_some())
        + usize::from(state.outlines.remove(&key).is_some());
    if removed > 0 {
        debug!(turn, removed, "memory rows purged");
    }
    removed
}

/// Memory commands after duplicate rows were collapsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupedLog {
    /// Non-log commands in their original order, followed by at most one
    /// summary and one outline command.
    pub commands: Vec<Command>,
    /// Rows dropped as duplicates.
    pub dropped: usize,
}

#[derive(Default)]
struct LogRows {
    rows: BTreeMap<u32, Map<String, Value>>,
    dropped: usize,
}

impl LogRows {
    fn offer<R: TableRow>(
        &mut self,
        canon: &Table<R>,
        text_field: &str,
        row: &Map<String, Value>,
        default_turn: u32,
    ) {
        let mut row = canon.canonicalize(row);
        let turn = row
            .get("turn")
            .and_then(|value| match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .and_then(|turn| u32::try_from(turn).ok())
            .unwrap_or(default_turn);
        row.insert("turn".to_owned(), Value::from(turn));

        let placeholder = |row: &Map<String, Value>| {
            row.get(text_field)
                .and_then(Value::as_str)
                .is_none_or(is_placeholder)
        };
        match self.rows.entry(turn) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                self.dropped += 1;
                if !placeholder(&row) || placeholder(slot.get()) {
                    slot.insert(row);
                }
            }
        }
    }

    fn into_command(self, action: Action, source: ServiceKey) -> Option<Command> {
        if self.rows.is_empty() {
            return None;
        }
        let rows = self.rows.into_values().map(Value::Object).collect();
        Some(Command::new(action, Value::Array(rows), source))
    }
}

/// Collapses the summary and outline rows of a memory batch to one row per
/// turn, keeping the most recent row that is not a placeholder. Rows
/// without a turn belong to `default_turn`.
#[must_use]
pub fn dedupe_log_commands(commands: Vec<Command>, default_turn: u32) -> DedupedLog {
    let summary_canon: Table<SummaryRow> = Table::new(SheetId::LogSummary.default_key_field());
    let outline_canon: Table<OutlineRow> = Table::new(SheetId::LogOutline.default_key_field());
    let mut summaries = LogRows::default();
    let mut outlines = LogRows::default();
    let mut passthrough = Vec::new();
    let mut source = ServiceKey::Memory;

    for command in commands {
        let rows: Option<Vec<(SheetId, Map<String, Value>)>> = match command.action {
            Action::AppendLogSummary | Action::AppendLogOutline => {
                let sheet = if command.action == Action::AppendLogSummary {
                    SheetId::LogSummary
                } else {
                    SheetId::LogOutline
                };
                payload_rows(&command.action, &command.value)
                    .ok()
                    .map(|rows| rows.into_iter().map(|row| (sheet.clone(), row)).collect())
            }
            Action::UpsertSheetRows => sheet_upserts(&command.action, &command.value)
                .ok()
                .filter(|payloads| payloads.iter().all(|p| p.sheet_id.is_memory_owned()))
                .map(|payloads| {
                    payloads
                        .into_iter()
                        .flat_map(|p| {
                            let sheet = p.sheet_id;
                            p.rows.into_iter().map(move |row| (sheet.clone(), row))
                        })
                        .collect()
                }),
            _ => None,
        };

        let Some(rows) = rows else {
            passthrough.push(command);
            continue;
        };
        source = command.source_service;
        for (sheet, row) in rows {
            if sheet == SheetId::LogSummary {
                summaries.offer(&summary_canon, "summary", &row, default_turn);
            } else {
                outlines.offer(&outline_canon, "outline", &row, default_turn);
            }
        }
    }

    let dropped = summaries.dropped + outlines.dropped;
    passthrough.extend(summaries.into_command(Action::AppendLogSummary, source));
    passthrough.extend(outlines.into_command(Action::AppendLogOutline, source));
    DedupedLog {
        commands: passthrough,
        dropped,
    }
}
