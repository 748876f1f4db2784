//! SQLite backend implementation
//!
//! Append-only indexed table over SQLite with WAL mode, so readers never
//! block the single batch writer. The schema is created with idempotent DDL
//! on open; there is no separate migration step.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::warn;

use crate::error::{AuditError, Result};
use crate::query::{ActorSelector, AuditQuery};
use crate::{AuditAction, AuditDetails, AuditEntry, AuditStore, StoreStats};

/// Idempotent schema: one append-only table plus the indexes backing the
/// common query shapes (by resource and by actor, both newest-first).
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        action TEXT NOT NULL,
        actor_id TEXT,
        actor_role TEXT,
        resource_id TEXT NOT NULL,
        details TEXT,
        ip_address TEXT,
        user_agent TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log (timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log (actor_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_log (resource_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log (action)",
    "CREATE INDEX IF NOT EXISTS idx_audit_resource_ts ON audit_log (resource_id, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_audit_actor_ts ON audit_log (actor_id, timestamp DESC)",
];

const SELECT_COLUMNS: &str =
    "SELECT timestamp, action, actor_id, actor_role, resource_id, details, ip_address, user_agent \
     FROM audit_log";

/// SQLite-backed audit store
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Open or create a SQLite database at the specified path
    ///
    /// Configures WAL mode for concurrent readers and creates the schema if
    /// it does not exist yet.
    pub async fn open(path: &str) -> Result<Self> {
        let db_url = if path.starts_with("sqlite://") {
            path.to_string()
        } else {
            format!("sqlite://{}", path)
        };

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Get the underlying pool (for advanced usage)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// Helper to convert a SqliteRow back into an AuditEntry. A corrupt details
// blob drops only the details field; the log carries a truncated preview,
// never the full payload.
fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry> {
    let action_str: String = row.try_get("action")?;
    let action = AuditAction::from_str(&action_str)?;

    let details_raw: Option<String> = row.try_get("details")?;
    let details = details_raw.and_then(|raw| match AuditDetails::from_canonical_json(&raw) {
        Ok(details) => Some(details),
        Err(e) => {
            let preview: String = raw.chars().take(64).collect();
            warn!(error = %e, preview = %preview, "Dropping malformed details payload");
            None
        }
    });

    Ok(AuditEntry {
        timestamp: row.try_get("timestamp")?,
        action,
        actor_id: row.try_get("actor_id")?,
        actor_role: row.try_get("actor_role")?,
        resource_id: row.try_get("resource_id")?,
        details,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
    })
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn insert_batch(&self, entries: &[AuditEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // Details are serialized before the transaction opens; a bad
        // payload fails the batch without touching the database.
        let mut blobs = Vec::with_capacity(entries.len());
        for entry in entries {
            let blob = match &entry.details {
                Some(details) => Some(details.to_canonical_json().map_err(AuditError::Details)?),
                None => None,
            };
            blobs.push(blob);
        }

        let mut tx = self.pool.begin().await?;

        for (entry, details_blob) in entries.iter().zip(blobs) {
            sqlx::query(
                "INSERT INTO audit_log
                 (timestamp, action, actor_id, actor_role, resource_id, details, ip_address, user_agent)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.timestamp)
            .bind(entry.action.as_str())
            .bind(&entry.actor_id)
            .bind(&entry.actor_role)
            .bind(&entry.resource_id)
            .bind(details_blob)
            .bind(&entry.ip_address)
            .bind(&entry.user_agent)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_COLUMNS);
        builder.push(" WHERE 1 = 1");

        match &query.actor {
            Some(ActorSelector::Anonymous) => {
                builder.push(" AND actor_id IS NULL");
            }
            Some(ActorSelector::Id(id)) => {
                builder.push(" AND actor_id = ").push_bind(id.clone());
            }
            None => {}
        }
        if let Some(action) = query.action {
            builder.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(resource_id) = &query.resource_id {
            builder
                .push(" AND resource_id = ")
                .push_bind(resource_id.clone());
        }
        if let Some(since) = query.since {
            builder
                .push(" AND timestamp >= ")
                .push_bind(AuditEntry::format_timestamp(since));
        }
        if let Some(until) = query.until {
            builder
                .push(" AND timestamp < ")
                .push_bind(AuditEntry::format_timestamp(until));
        }

        builder
            .push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(query.limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn load_recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY timestamp DESC, id DESC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<AuditEntry> =
            rows.iter().map(row_to_entry).collect::<Result<_>>()?;
        entries.reverse();
        Ok(entries)
    }

    async fn delete_before(&self, cutoff: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, MIN(timestamp) AS oldest, MAX(timestamp) AS newest
             FROM audit_log",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            total_entries: row.try_get::<i64, _>("total")? as u64,
            oldest_entry: row.try_get("oldest")?,
            newest_entry: row.try_get("newest")?,
        })
    }
}
