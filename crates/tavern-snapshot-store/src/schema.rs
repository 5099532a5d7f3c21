//! Snapshot store database schema.

/// SQL to create the snapshots table.
pub const CREATE_SNAPSHOTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS session_snapshots (
    slot_id  TEXT PRIMARY KEY NOT NULL,
    turn     INTEGER NOT NULL,
    payload  TEXT NOT NULL,
    saved_at TEXT NOT NULL
);
";
