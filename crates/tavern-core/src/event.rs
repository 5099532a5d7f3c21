//! Turn journal events.
//!
//! Each finished turn (committed, cancelled or failed) leaves one entry in
//! the state's transaction journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of journal entries retained in a state document.
pub const JOURNAL_LIMIT: usize = 80;

/// Terminal status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The turn's effects were kept.
    Committed,
    /// The turn was aborted through its cancellation token.
    Cancelled,
    /// A service failure ended the turn.
    Failed,
}

/// One entry in the transaction journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnJournalEntry {
    /// Unique, time-ordered transaction identifier.
    pub tx_id: Uuid,
    /// Turn the entry describes.
    pub turn: u32,
    /// Outcome.
    pub status: TurnStatus,
    /// Commands that applied.
    pub applied: usize,
    /// Commands that were rejected or dropped.
    pub rejected: usize,
    /// Conflicts recorded during the turn.
    pub conflicts: usize,
    /// Free-form note, e.g. the abort reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// When the turn finished.
    pub occurred_at: DateTime<Utc>,
}

impl TurnJournalEntry {
    /// Creates an entry with a fresh v7 transaction id.
    #[must_use]
    pub fn new(turn: u32, status: TurnStatus, occurred_at: DateTime<Utc>) -> Self {
        Self {
            tx_id: Uuid::now_v7(),
            turn,
            status,
            applied: 0,
            rejected: 0,
            conflicts: 0,
            note: None,
            occurred_at,
        }
    }
}

/// Appends an entry, dropping the oldest entries beyond [`JOURNAL_LIMIT`].
pub fn push_journal_entry(journal: &mut Vec<TurnJournalEntry>, entry: TurnJournalEntry) {
    journal.push(entry);
    if journal.len() > JOURNAL_LIMIT {
        let excess = journal.len() - JOURNAL_LIMIT;
        journal.drain(..excess);
    }
}
