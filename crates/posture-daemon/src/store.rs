//! `SQLite` persistence for finding state and remediation history.
//!
//! Both stores share one connection behind `Arc<Mutex<Connection>>`. Calls
//! run on the blocking pool so the async executor never waits on disk.
//!
//! A conditional write is one immediate transaction: read the stored status
//! and version, check the precondition, then store the row under the
//! successor version. Versions are assigned here and never taken from the
//! caller.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use posture_core::ingestion::{HistoryError, RemediationHistory, RemediationHistoryEntry};
use posture_core::state_store::{
    FindingRecord, FindingTable, Precondition, StoreError, WriteOutcome,
};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::debug;

/// Opens (or creates) the database at `path` and initializes the schema.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or the schema cannot be
/// created.
pub fn open_database(path: &Path) -> rusqlite::Result<Arc<Mutex<Connection>>> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    init_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Creates the tables if they do not exist.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS finding_state (
            finding_id TEXT PRIMARY KEY,
            remediation_status TEXT NOT NULL,
            version INTEGER NOT NULL,
            expire_at INTEGER NOT NULL,
            record_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_finding_state_expire_at
            ON finding_state(expire_at);
        CREATE TABLE IF NOT EXISTS remediation_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            finding_id TEXT NOT NULL,
            control_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            execution_id TEXT NOT NULL,
            origin TEXT NOT NULL,
            triggered_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_remediation_history_finding
            ON remediation_history(finding_id);",
    )
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn as_sql_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

// =============================================================================
// Finding state
// =============================================================================

/// Finding state table stored in `SQLite`.
#[derive(Debug, Clone)]
pub struct SqliteFindingTable {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFindingTable {
    /// Wraps a connection whose schema is already initialized.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&conn)
        })
        .await
        .map_err(unavailable)?
    }

    /// Deletes records whose retention has elapsed at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the delete fails.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now.timestamp();
        let purged = self
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM finding_state WHERE expire_at <= ?1",
                    params![cutoff],
                )
                .map_err(unavailable)
            })
            .await?;
        debug!(purged, "expired finding records purged");
        Ok(purged)
    }

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the count fails.
    pub async fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM finding_state", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| usize::try_from(n).unwrap_or(0))
            .map_err(unavailable)
        })
        .await
    }
}

#[async_trait]
impl FindingTable for SqliteFindingTable {
    async fn get(&self, finding_id: &str) -> Result<Option<FindingRecord>, StoreError> {
        let id = finding_id.to_string();
        self.with_conn(move |conn| {
            let json = conn
                .query_row(
                    "SELECT record_json FROM finding_state WHERE finding_id = ?1",
                    params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(unavailable)?;
            json.map(|json| {
                serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                    finding_id: id.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
        })
        .await
    }

    async fn put(
        &self,
        mut record: FindingRecord,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        self.with_conn(move |conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            let current = tx
                .query_row(
                    "SELECT remediation_status, version FROM finding_state WHERE finding_id = ?1",
                    params![record.finding_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
                .map_err(unavailable)?;

            let holds = match (precondition, &current) {
                (Precondition::None, _) => true,
                (Precondition::Absent, current) => current.is_none(),
                (Precondition::StatusIs(expected), Some((status, _))) => {
                    status == expected.as_str()
                },
                (Precondition::VersionIs(expected), Some((_, version))) => {
                    *version == as_sql_version(expected)
                },
                (Precondition::StatusIs(_) | Precondition::VersionIs(_), None) => false,
            };
            if !holds {
                return Ok(WriteOutcome::PreconditionFailed);
            }

            let version = current.map_or(1, |(_, version)| version.saturating_add(1));
            record.version = u64::try_from(version).unwrap_or(u64::MAX);
            let json = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
                finding_id: record.finding_id.clone(),
                reason: e.to_string(),
            })?;
            tx.execute(
                "INSERT INTO finding_state
                    (finding_id, remediation_status, version, expire_at, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(finding_id) DO UPDATE SET
                    remediation_status = excluded.remediation_status,
                    version = excluded.version,
                    expire_at = excluded.expire_at,
                    record_json = excluded.record_json",
                params![
                    record.finding_id,
                    record.remediation_status.as_str(),
                    version,
                    record.expire_at.timestamp(),
                    json
                ],
            )
            .map_err(unavailable)?;
            tx.commit().map_err(unavailable)?;

            Ok(WriteOutcome::Written {
                version: record.version,
            })
        })
        .await
    }
}

// =============================================================================
// Remediation history
// =============================================================================

/// Append-only remediation history stored in `SQLite`.
#[derive(Debug, Clone)]
pub struct SqliteRemediationHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRemediationHistory {
    /// Wraps a connection whose schema is already initialized.
    #[must_use]
    pub const fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// History for one finding, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Unavailable`] when the query fails or a row
    /// cannot be decoded.
    pub async fn entries_for(
        &self,
        finding_id: &str,
    ) -> Result<Vec<RemediationHistoryEntry>, HistoryError> {
        let conn = Arc::clone(&self.conn);
        let id = finding_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| HistoryError::Unavailable("connection lock poisoned".to_string()))?;
            let mut stmt = conn
                .prepare(
                    "SELECT finding_id, control_id, account_id, execution_id, origin, triggered_at
                     FROM remediation_history WHERE finding_id = ?1 ORDER BY id",
                )
                .map_err(|e| HistoryError::Unavailable(e.to_string()))?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(|e| HistoryError::Unavailable(e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                let (finding_id, control_id, account_id, execution_id, origin, triggered_at) =
                    row.map_err(|e| HistoryError::Unavailable(e.to_string()))?;
                entries.push(RemediationHistoryEntry {
                    finding_id,
                    control_id,
                    account_id,
                    execution_id,
                    origin: serde_json::from_value(serde_json::Value::String(origin))
                        .map_err(|e| HistoryError::Unavailable(e.to_string()))?,
                    triggered_at: DateTime::parse_from_rfc3339(&triggered_at)
                        .map_err(|e| HistoryError::Unavailable(e.to_string()))?
                        .with_timezone(&Utc),
                });
            }
            Ok(entries)
        })
        .await
        .map_err(|e| HistoryError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl RemediationHistory for SqliteRemediationHistory {
    async fn append(&self, entry: RemediationHistoryEntry) -> Result<(), HistoryError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| HistoryError::Unavailable("connection lock poisoned".to_string()))?;
            conn.execute(
                "INSERT INTO remediation_history
                    (finding_id, control_id, account_id, execution_id, origin, triggered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.finding_id,
                    entry.control_id,
                    entry.account_id,
                    entry.execution_id,
                    entry.origin.as_str(),
                    entry.triggered_at.to_rfc3339(),
                ],
            )
            .map_err(|e| HistoryError::Unavailable(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| HistoryError::Unavailable(e.to_string()))?
    }
}
