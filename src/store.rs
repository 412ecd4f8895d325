//! Durable event log.
//!
//! SQLite table of accepted presses, each carrying a delivery flag. This is
//! the single source of truth for "has this press been forwarded". The log is
//! append-only: records are never deleted and `sent` only ever goes 0 → 1.
//!
//! Every operation serializes on one connection mutex, so the flush cycle and
//! the upload cycle can share an `Arc<EventLog>` without further locking.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection};

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: event table
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        ts_ms   INTEGER NOT NULL,
        sent    INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_events_unsent ON events(id) WHERE sent = 0;
    "#,
];

/// One row of the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    /// Monotonically increasing id assigned on insert
    pub id: i64,

    /// Wall-clock time of acceptance, epoch milliseconds
    pub timestamp_ms: i64,

    /// Whether the collector confirmed this record
    pub delivered: bool,
}

/// Record counts for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCounts {
    /// All records ever inserted
    pub total: u64,

    /// Records confirmed by the collector
    pub delivered: u64,

    /// Records still waiting for upload
    pub pending: u64,
}

/// Handle to the durable log.
pub struct EventLog {
    conn: Mutex<Connection>,
    #[cfg(test)]
    counts_broken: std::sync::atomic::AtomicBool,
}

impl EventLog {
    /// Open or create the log at the given path and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets readers proceed during a write; FULL makes a commit
        // survive power loss, not just a process crash.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 30000;
            ",
        )?;

        Self::from_connection(conn)
    }

    /// Open an in-memory log (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            #[cfg(test)]
            counts_broken: Default::default(),
        })
    }

    // SQLite rolls back any transaction a panicking holder left open, so the
    // connection is still usable after poisoning.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append timestamps as undelivered records, in order, in one transaction.
    ///
    /// Returns the assigned ids. The records are durable when this returns.
    pub fn insert_batch(&self, timestamps: &[i64]) -> Result<Vec<i64>> {
        if timestamps.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(timestamps.len());
        {
            let mut stmt = tx.prepare_cached("INSERT INTO events (ts_ms, sent) VALUES (?1, 0)")?;
            for ts in timestamps {
                stmt.execute(params![ts])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;

        tracing::debug!(count = ids.len(), "Inserted events into durable log");
        Ok(ids)
    }

    /// Up to `limit` undelivered records, oldest first.
    pub fn fetch_undelivered(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts_ms, sent FROM events WHERE sent = 0 ORDER BY id ASC LIMIT ?1",
        )?;

        let records = stmt
            .query_map(params![limit as i64], |row| {
                Ok(EventRecord {
                    id: row.get(0)?,
                    timestamp_ms: row.get(1)?,
                    delivered: row.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Mark records as delivered. Unknown and already-delivered ids are ignored.
    ///
    /// Returns the number of records that changed state.
    pub fn mark_delivered(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached("UPDATE events SET sent = 1 WHERE id = ?1 AND sent = 0")?;
            for id in ids {
                changed += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;

        Ok(changed)
    }

    /// Look up a single record by id.
    pub fn get(&self, id: i64) -> Result<Option<EventRecord>> {
        use rusqlite::OptionalExtension;

        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT id, ts_ms, sent FROM events WHERE id = ?1",
                params![id],
                |row| {
                    Ok(EventRecord {
                        id: row.get(0)?,
                        timestamp_ms: row.get(1)?,
                        delivered: row.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Total, delivered and pending record counts.
    pub fn counts(&self) -> Result<LogCounts> {
        #[cfg(test)]
        if self.counts_broken.load(std::sync::atomic::Ordering::Acquire) {
            return Err(rusqlite::Error::InvalidQuery.into());
        }

        let conn = self.conn();
        let (total, delivered): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(sent), 0) FROM events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let total = total as u64;
        let delivered = delivered as u64;
        Ok(LogCounts {
            total,
            delivered,
            pending: total.saturating_sub(delivered),
        })
    }
}

#[cfg(test)]
impl EventLog {
    /// Drop the events table so every later statement fails.
    pub(crate) fn break_for_tests(&self) -> Result<()> {
        self.conn().execute_batch("DROP TABLE events")?;
        Ok(())
    }

    /// Make `counts` fail while every other operation keeps working.
    pub(crate) fn break_counts_for_tests(&self) {
        self.counts_broken
            .store(true, std::sync::atomic::Ordering::Release);
    }
}

/// Run a log operation on the blocking pool, off the async workers.
pub async fn blocking<T, F>(log: &Arc<EventLog>, op: F) -> Result<T>
where
    F: FnOnce(&EventLog) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let log = Arc::clone(log);
    tokio::task::spawn_blocking(move || op(&log)).await?
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    Ok(())
}
