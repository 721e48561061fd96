use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::error::TimerError;
use crate::models::{
    CycleCounters, InterruptionRecord, OfflineQueueEntry, QueueStats, SessionMutation,
    TimerSnapshot,
};
use chrono::Utc;
use rusqlite::Error::InvalidParameterName;

const META_CYCLE_COUNTERS: &str = "cycle_counters";
const META_INTERRUPTION: &str = "last_interruption";
pub(crate) const META_LAST_REPLAY_AT: &str = "last_replay_at";

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Logging only; the caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!("[DB] {}: Disk full. Snapshot cannot be made durable.", context);
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check the data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

/// SQLite-backed local store: timer snapshot, offline queue, cycle counters.
/// The session machine is the only writer of the snapshot row.
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Lock the connection, mapping a poisoned mutex to an SQLite error.
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Database mutex poisoned: {}. A panic occurred while holding the lock.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;

        // GUARD: integrity check before anything touches the schema
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Database corruption detected: {}",
                integrity
            )));
        }

        if let Err(e) =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))
        {
            warn!(
                "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                e
            );
        }
        // FULL: a committed snapshot must survive power loss
        let _ = conn.pragma_update(None, "synchronous", "FULL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open the database; on corruption move the file aside and start fresh.
    pub fn open_with_recovery(db_path: &Path) -> Result<Self, TimerError> {
        let path_str = db_path.to_str().ok_or_else(|| {
            TimerError::PersistenceFailure(format!(
                "Database path contains invalid UTF-8: {}",
                db_path.display()
            ))
        })?;

        match Database::new(path_str) {
            Ok(db) => Ok(db),
            Err(e) => {
                let err_str = e.to_string();
                let is_corruption = err_str.contains("corruption")
                    || err_str.contains("integrity")
                    || err_str.contains("not a database");
                if !is_corruption || !db_path.exists() {
                    return Err(TimerError::PersistenceFailure(format!(
                        "Failed to initialize database: {}",
                        e
                    )));
                }
                let backup_path = db_path.with_file_name(format!(
                    "{}.corrupted.{}",
                    db_path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("focus.db"),
                    Utc::now().timestamp()
                ));
                std::fs::rename(db_path, &backup_path).map_err(|rename_e| {
                    warn!(
                        "[DB] Failed to rename corrupted DB to {:?}: {}",
                        backup_path, rename_e
                    );
                    TimerError::PersistenceFailure(format!(
                        "Database corrupted and could not backup: {}",
                        e
                    ))
                })?;
                info!(
                    "[DB] Corrupted DB backed up to {:?}, starting fresh",
                    backup_path
                );
                Database::new(path_str).map_err(|e2| {
                    TimerError::PersistenceFailure(format!(
                        "Failed to create fresh database: {}",
                        e2
                    ))
                })
            }
        }
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 2;

    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS timer_snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS offline_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_retry_at INTEGER,
                error_message TEXT
            )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS app_meta (key TEXT PRIMARY KEY, value TEXT)",
                [],
            )?;
        }

        // Migration 2: user index for queue stats per account
        if current < 2 {
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_offline_queue_user ON offline_queue(user_id)",
                [],
            )?;
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    /// Run `f` inside BEGIN IMMEDIATE … COMMIT, rolling back on any error.
    fn in_transaction<T>(
        &self,
        context: &str,
        f: impl FnOnce(&Connection) -> SqliteResult<T>,
    ) -> SqliteResult<T> {
        let conn = self.lock_conn()?;
        conn.execute("BEGIN IMMEDIATE TRANSACTION", []).map_err(|e| {
            log_io_error_if_any(context, &e);
            error!("[DB] {}: failed to begin transaction: {}", context, e);
            e
        })?;

        match f(&conn) {
            Ok(value) => {
                conn.execute("COMMIT", []).map_err(|e| {
                    log_io_error_if_any(context, &e);
                    error!("[DB] {}: failed to commit transaction: {}", context, e);
                    let _ = conn.execute("ROLLBACK", []);
                    e
                })?;
                Ok(value)
            }
            Err(e) => {
                log_io_error_if_any(context, &e);
                error!("[DB] {}: {}. Rolling back transaction.", context, e);
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    // ============================================
    // TIMER SNAPSHOT
    // ============================================

    /// Durably replace the snapshot. Returns only after COMMIT.
    pub fn save_snapshot(&self, snapshot: &TimerSnapshot) -> SqliteResult<()> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| InvalidParameterName(format!("Snapshot serialization: {}", e)))?;
        let now = Utc::now().timestamp();
        self.in_transaction("save_snapshot", |conn| {
            conn.execute(
                "INSERT INTO timer_snapshot (id, payload, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET payload = ?1, updated_at = ?2",
                params![payload, now],
            )?;
            Ok(())
        })
    }

    /// Load the snapshot. A row that does not parse is `RecoveryDataCorrupt`;
    /// the caller decides whether to discard it.
    pub fn load_snapshot(&self) -> Result<Option<TimerSnapshot>, TimerError> {
        let payload: Option<String> = {
            let conn = self.lock_conn()?;
            conn.query_row("SELECT payload FROM timer_snapshot WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?
        };

        match payload {
            None => Ok(None),
            Some(raw) => serde_json::from_str::<TimerSnapshot>(&raw)
                .map(Some)
                .map_err(|e| TimerError::RecoveryDataCorrupt(format!("snapshot payload: {}", e))),
        }
    }

    pub fn clear_snapshot(&self) -> SqliteResult<()> {
        self.in_transaction("clear_snapshot", |conn| {
            conn.execute("DELETE FROM timer_snapshot", [])?;
            Ok(())
        })
    }

    /// Clear the snapshot and store the updated cycle counters in one transaction.
    pub fn finish_snapshot(&self, counters: &CycleCounters) -> SqliteResult<()> {
        let counters_json = serde_json::to_string(counters)
            .map_err(|e| InvalidParameterName(format!("Counters serialization: {}", e)))?;
        self.in_transaction("finish_snapshot", |conn| {
            conn.execute("DELETE FROM timer_snapshot", [])?;
            conn.execute(
                "INSERT INTO app_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![META_CYCLE_COUNTERS, counters_json],
            )?;
            Ok(())
        })
    }

    /// Stored counters; unreadable values fall back to zero with a warning.
    pub fn load_cycle_counters(&self) -> SqliteResult<CycleCounters> {
        match self.get_app_meta(META_CYCLE_COUNTERS)? {
            None => Ok(CycleCounters::default()),
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("[DB] Cycle counters unreadable ({}), resetting to zero", e);
                CycleCounters::default()
            })),
        }
    }

    // ============================================
    // APP META / INTERRUPTION RECORD
    // ============================================

    pub fn get_app_meta(&self, key: &str) -> SqliteResult<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT value FROM app_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_app_meta(&self, key: &str, value: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_app_meta(&self, key: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM app_meta WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn save_interruption(&self, record: &InterruptionRecord) -> SqliteResult<()> {
        let raw = serde_json::to_string(record)
            .map_err(|e| InvalidParameterName(format!("Interruption serialization: {}", e)))?;
        self.set_app_meta(META_INTERRUPTION, &raw)
    }

    pub fn load_interruption(&self) -> SqliteResult<Option<InterruptionRecord>> {
        let raw = match self.get_app_meta(META_INTERRUPTION)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("[DB] Interruption record unreadable ({}), dropping it", e);
                self.delete_app_meta(META_INTERRUPTION)?;
                Ok(None)
            }
        }
    }

    pub fn clear_interruption(&self) -> SqliteResult<()> {
        self.delete_app_meta(META_INTERRUPTION)
    }

    // ============================================
    // OFFLINE QUEUE
    // ============================================

    /// Append a mutation, or merge it into the entry already queued for the same
    /// session (the entry keeps its FIFO position).
    pub fn enqueue_mutation(&self, mutation: &SessionMutation) -> SqliteResult<i64> {
        let now = Utc::now().timestamp();
        self.in_transaction("enqueue_mutation", |conn| {
            let existing: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, payload FROM offline_queue WHERE session_id = ?1",
                    params![mutation.session_id()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((id, raw)) => {
                    let merged = match serde_json::from_str::<SessionMutation>(&raw) {
                        Ok(mut queued) => {
                            queued.merge(mutation.clone());
                            queued
                        }
                        Err(e) => {
                            warn!(
                                "[DB] Queued payload for {} unreadable ({}), replacing it",
                                mutation.session_id(),
                                e
                            );
                            mutation.clone()
                        }
                    };
                    let payload = serde_json::to_string(&merged).map_err(|e| {
                        InvalidParameterName(format!("Mutation serialization: {}", e))
                    })?;
                    conn.execute(
                        "UPDATE offline_queue SET payload = ?1 WHERE id = ?2",
                        params![payload, id],
                    )?;
                    Ok(id)
                }
                None => {
                    let payload = serde_json::to_string(mutation).map_err(|e| {
                        InvalidParameterName(format!("Mutation serialization: {}", e))
                    })?;
                    conn.execute(
                        "INSERT INTO offline_queue (session_id, user_id, payload, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![mutation.session_id(), mutation.user_id, payload, now],
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            }
        })
    }

    pub fn has_pending_for_session(&self, session_id: &str) -> SqliteResult<bool> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM offline_queue WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Queued entries in FIFO order.
    /// With `respect_backoff` an entry is skipped until its backoff window passed:
    /// 10s → 20s → 40s → 80s → 120s (max).
    pub fn pending_mutations(
        &self,
        limit: i64,
        respect_backoff: bool,
    ) -> SqliteResult<Vec<OfflineQueueEntry>> {
        let now = Utc::now().timestamp();
        let backoff_sql = if respect_backoff {
            "CASE
              WHEN retry_count = 0 THEN 10
              WHEN retry_count = 1 THEN 20
              WHEN retry_count = 2 THEN 40
              WHEN retry_count = 3 THEN 80
              ELSE 120
          END"
        } else {
            "0"
        };
        let sql = format!(
            "SELECT id, payload, retry_count, created_at, last_retry_at, error_message
             FROM offline_queue
             WHERE last_retry_at IS NULL OR last_retry_at + {} <= ?1
             ORDER BY id ASC
             LIMIT ?2",
            backoff_sql
        );

        let raw_rows: Vec<(i64, String, i32, i64, Option<i64>, Option<String>)> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![now, limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?;
            rows.collect::<SqliteResult<Vec<_>>>()?
        };

        let mut result = Vec::with_capacity(raw_rows.len());
        for (id, payload, retry_count, created_at, last_retry_at, error_message) in raw_rows {
            match serde_json::from_str::<SessionMutation>(&payload) {
                Ok(mutation) => result.push(OfflineQueueEntry {
                    id,
                    mutation,
                    retry_count,
                    created_at,
                    last_retry_at,
                    error_message,
                }),
                Err(e) => {
                    // One broken row must not block the rest of the queue
                    warn!("[DB] Skipping queue entry {}: unreadable payload ({})", id, e);
                }
            }
        }
        Ok(result)
    }

    /// Remove a replayed entry unless a newer mutation was merged into it meanwhile.
    /// Returns whether the row was removed.
    pub fn remove_queue_entry_if_unchanged(
        &self,
        id: i64,
        replayed: &SessionMutation,
    ) -> SqliteResult<bool> {
        let payload = serde_json::to_string(replayed)
            .map_err(|e| InvalidParameterName(format!("Mutation serialization: {}", e)))?;
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM offline_queue WHERE id = ?1 AND payload = ?2",
            params![id, payload],
        )?;
        Ok(removed > 0)
    }

    pub fn mark_queue_retry(
        &self,
        id: i64,
        retry_count: i32,
        error_message: &str,
    ) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "UPDATE offline_queue
             SET retry_count = ?1, last_retry_at = ?2, error_message = ?3
             WHERE id = ?4",
            params![retry_count, now, error_message, id],
        )?;
        Ok(())
    }

    pub fn pending_count(&self) -> SqliteResult<i64> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
    }

    pub fn queue_stats(&self, stuck_after_retries: i32) -> SqliteResult<QueueStats> {
        let (pending_count, stuck_count, oldest_created_at) = {
            let conn = self.lock_conn()?;
            let pending_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))?;
            let stuck_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM offline_queue WHERE retry_count >= ?1",
                params![stuck_after_retries],
                |row| row.get(0),
            )?;
            let oldest_created_at: Option<i64> =
                conn.query_row("SELECT MIN(created_at) FROM offline_queue", [], |row| {
                    row.get(0)
                })?;
            (pending_count, stuck_count, oldest_created_at)
        };
        let last_replay_at = self
            .get_app_meta(META_LAST_REPLAY_AT)?
            .and_then(|v| v.parse::<i64>().ok());

        Ok(QueueStats {
            pending_count,
            stuck_count,
            oldest_created_at,
            last_replay_at,
        })
    }
}
