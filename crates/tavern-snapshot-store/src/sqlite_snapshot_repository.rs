//! SQLite implementation of the `SnapshotRepository` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, instrument};

use tavern_core::error::DomainError;
use tavern_core::repository::{PersistedSnapshot, SnapshotRepository};

use crate::schema::CREATE_SNAPSHOTS_TABLE;

type SnapshotRow = (String, i64, String, DateTime<Utc>);

fn infrastructure(context: &str) -> impl Fn(sqlx::Error) -> DomainError + '_ {
    move |e| DomainError::Infrastructure(format!("{context}: {e}"))
}

/// SQLite-backed snapshot repository.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotRepository {
    pool: SqlitePool,
}

impl SqliteSnapshotRepository {
    /// Creates a new `SqliteSnapshotRepository` over an existing pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a pool for `database_url` and makes sure the schema exists.
    /// In-memory databases get a single connection so every query sees the
    /// same database.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the database cannot be
    /// opened or the schema cannot be created.
    #[instrument]
    pub async fn connect(database_url: &str) -> Result<Self, DomainError> {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(infrastructure("failed to open snapshot database"))?;
        let repo = Self::new(pool);
        repo.ensure_schema().await?;
        info!("snapshot store ready");
        Ok(repo)
    }

    /// Creates the snapshots table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the statement fails.
    pub async fn ensure_schema(&self) -> Result<(), DomainError> {
        sqlx::query(CREATE_SNAPSHOTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(infrastructure("failed to create snapshot schema"))?;
        Ok(())
    }
}

fn snapshot_from_row(row: SnapshotRow) -> Result<PersistedSnapshot, DomainError> {
    let (slot_id, turn, payload, saved_at) = row;
    let turn = u32::try_from(turn)
        .map_err(|_| DomainError::Infrastructure(format!("invalid turn {turn} for {slot_id}")))?;
    let payload = serde_json::from_str(&payload).map_err(|e| {
        DomainError::Infrastructure(format!("snapshot payload for {slot_id} is not JSON: {e}"))
    })?;
    Ok(PersistedSnapshot {
        slot_id,
        turn,
        payload,
        saved_at,
    })
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn load_snapshot(&self, slot_id: &str) -> Result<Option<PersistedSnapshot>, DomainError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT slot_id, turn, payload, saved_at FROM session_snapshots WHERE slot_id = ?",
        )
        .bind(slot_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infrastructure("failed to load snapshot"))?;
        row.map(snapshot_from_row).transpose()
    }

    async fn save_snapshot(&self, snapshot: &PersistedSnapshot) -> Result<(), DomainError> {
        let payload = serde_json::to_string(&snapshot.payload).map_err(|e| {
            DomainError::Infrastructure(format!("failed to serialize snapshot payload: {e}"))
        })?;
        sqlx::query(
            "INSERT OR REPLACE INTO session_snapshots (slot_id, turn, payload, saved_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&snapshot.slot_id)
        .bind(i64::from(snapshot.turn))
        .bind(payload)
        .bind(snapshot.saved_at)
        .execute(&self.pool)
        .await
        .map_err(infrastructure("failed to save snapshot"))?;
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<String>, DomainError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT slot_id FROM session_snapshots ORDER BY slot_id")
                .fetch_all(&self.pool)
                .await
                .map_err(infrastructure("failed to list slots"))?;
        Ok(rows.into_iter().map(|(slot_id,)| slot_id).collect())
    }
}
