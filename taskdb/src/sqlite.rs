//! SQLite-backed task store.
//!
//! A single database file holds the whole queue. The file is opened in WAL
//! mode so readers proceed concurrently with the single writer, and every
//! state transition runs inside one transaction, which is what makes the
//! reservation protocol safe across processes: two reservers racing on the
//! same file serialize on the write lock and each claims a disjoint batch.

use std::{
    fs::File,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{named_params, Connection, ErrorCode, OpenFlags, Row, TransactionBehavior};

use crate::{ReservedTask, TaskDbError, TaskDbResult, TaskRecord, TaskStatus, TaskStore};

/// Bump when backward compatibility is broken; `open` refuses files
/// recorded with a newer version.
pub const TASK_DB_VERSION: u32 = 1;

/// Fixed-width UTC text format for persisted timestamps. Fixed width keeps
/// SQL string comparison identical to chronological comparison, which the
/// reservation scan (`available_at <= now`) relies on.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn timestamp_to_sql(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

fn timestamp_from_sql(raw: &str) -> TaskDbResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| TaskDbError::Corrupted(format!("bad timestamp {raw:?}: {e}")))
}

impl From<rusqlite::Error> for TaskDbError {
    fn from(error: rusqlite::Error) -> TaskDbError {
        TaskDbError::Sql(error.to_string())
    }
}

#[derive(Debug)]
pub struct TaskDb {
    conn: Connection,
}

impl TaskDb {
    fn open(path: &Path) -> TaskDbResult<Connection> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        Self::configure(&conn)?;
        Self::check_version(&conn)?;
        Ok(conn)
    }

    fn configure(conn: &Connection) -> TaskDbResult<()> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        // Concurrent processes block on the write lock instead of erroring.
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    fn create(path: &Path) -> TaskDbResult<Connection> {
        let _file = File::options()
            .write(true)
            .read(true)
            .create_new(true)
            .open(path)?;

        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        Self::configure(&conn)?;
        Self::create_tables(&conn)?;

        Ok(conn)
    }

    /// Open an existing task database at `path`, or create one if the file
    /// does not exist yet.
    pub fn open_or_create(path: &Path) -> TaskDbResult<Self> {
        let conn = if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }?;
        Ok(Self { conn })
    }

    // SQL
    // ----------------------------------------------------------------

    fn create_tables(conn: &Connection) -> TaskDbResult<()> {
        conn.execute_batch(&format!(
            r#"
            -- Metadata and mappings
            -----------------------------------------------
            CREATE TABLE metadata(
              key TEXT UNIQUE NOT NULL PRIMARY KEY,
              value INTEGER NOT NULL
            );

            INSERT INTO
              metadata(key, value)
            VALUES
              ('task_db_version', {TASK_DB_VERSION});

            CREATE TABLE status_codes(
              id INTEGER UNIQUE NOT NULL PRIMARY KEY,
              desc TEXT NOT NULL
            );

            INSERT INTO
              status_codes(id, desc)
            VALUES
              (0, 'success'),
              (1000, 'pending'),
              (2000, 'in_progress'),
              (-1000, 'failed');

            -- Data
            -----------------------------------------------
            -- One row per task. Timestamps are fixed-width UTC text so that
            -- string comparison orders chronologically. payload and
            -- result_value are opaque codec output.
            CREATE TABLE tasks(
              task_id TEXT UNIQUE NOT NULL PRIMARY KEY,
              status INTEGER NOT NULL,
              payload BLOB NOT NULL,
              enqueued_at TIMESTAMP NOT NULL,
              available_at TIMESTAMP NOT NULL,
              started_at TIMESTAMP,
              finished_at TIMESTAMP,
              result_value BLOB,
              error TEXT,
              traceback TEXT,
              FOREIGN KEY(status) REFERENCES status_codes(id)
            );

            -- The reservation scan filters on eligibility.
            CREATE INDEX tasks_ready ON tasks(status, available_at);
            "#,
        ))?;

        Ok(())
    }

    fn check_version(conn: &Connection) -> TaskDbResult<()> {
        let found: u32 = conn.query_row(
            "SELECT value FROM metadata WHERE key = 'task_db_version'",
            [],
            |row| row.get(0),
        )?;
        if found > TASK_DB_VERSION {
            return Err(TaskDbError::SchemaVersion {
                found,
                supported: TASK_DB_VERSION,
            });
        }
        Ok(())
    }

    /// Set a tracer to debug SQL execution,
    /// for example:
    ///   db.set_tracer(Some(|stmt| println!("sqlite: {stmt}")));
    #[cfg(test)]
    pub fn set_tracer(&mut self, trace_fn: Option<fn(_: &str)>) {
        self.conn.trace(trace_fn);
    }
}

/// Shareable [`TaskStore`] over a [`TaskDb`]. Within one process all calls
/// serialize on an internal mutex; across processes SQLite's own locking
/// does the serialization.
#[derive(Clone)]
pub struct SqliteTaskStore {
    db: Arc<Mutex<TaskDb>>,
}

impl SqliteTaskStore {
    pub fn open(path: &Path) -> TaskDbResult<Self> {
        let db = TaskDb::open_or_create(path)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn current_status(conn: &Connection, task_id: &str) -> TaskDbResult<Option<TaskStatus>> {
        let mut stmt = conn.prepare("SELECT status FROM tasks WHERE task_id = :task_id")?;
        let mut rows = stmt.query(named_params! { ":task_id": task_id })?;
        match rows.next()? {
            Some(row) => {
                let code: i32 = row.get(0)?;
                let status = TaskStatus::try_from(code)
                    .map_err(|_| TaskDbError::Corrupted(format!("unknown status code {code}")))?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    fn record_from_row(row: &Row<'_>) -> TaskDbResult<TaskRecord> {
        let code: i32 = row.get(1)?;
        let status = TaskStatus::try_from(code)
            .map_err(|_| TaskDbError::Corrupted(format!("unknown status code {code}")))?;

        let enqueued_at: String = row.get(5)?;
        let started_at: Option<String> = row.get(6)?;
        let finished_at: Option<String> = row.get(7)?;

        Ok(TaskRecord {
            task_id: row.get(0)?,
            status,
            result_value: row.get(2)?,
            error: row.get(3)?,
            traceback: row.get(4)?,
            enqueued_at: timestamp_from_sql(&enqueued_at)?,
            started_at: started_at.as_deref().map(timestamp_from_sql).transpose()?,
            finished_at: finished_at.as_deref().map(timestamp_from_sql).transpose()?,
        })
    }
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
    async fn enqueue(
        &self,
        task_id: &str,
        payload: &[u8],
        available_at: DateTime<Utc>,
    ) -> TaskDbResult<()> {
        let db = self.db.lock().unwrap();
        let enqueued_at = Utc::now();
        let available_at = available_at.max(enqueued_at);

        let result = db.conn.execute(
            "INSERT INTO
               tasks(task_id, status, payload, enqueued_at, available_at)
             VALUES
               (:task_id, :status, :payload, :enqueued_at, :available_at)",
            named_params! {
                ":task_id": task_id,
                ":status": i32::from(TaskStatus::Pending),
                ":payload": payload,
                ":enqueued_at": timestamp_to_sql(&enqueued_at),
                ":available_at": timestamp_to_sql(&available_at),
            },
        );

        match result {
            Ok(_) => {
                tracing::debug!("SqliteTaskStore.enqueue: {task_id}");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(TaskDbError::DuplicateTaskId(task_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reserve(
        &self,
        max_items: usize,
        now: DateTime<Utc>,
    ) -> TaskDbResult<Vec<ReservedTask>> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let mut db = self.db.lock().unwrap();
        // IMMEDIATE takes the write lock up front, so the select-then-update
        // pair below is atomic with respect to any other reserver.
        let tx = db
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now_sql = timestamp_to_sql(&now);

        let candidates = {
            let mut stmt = tx.prepare(
                "SELECT
                   task_id, payload, enqueued_at
                 FROM
                   tasks
                 WHERE
                   status = :pending
                   AND available_at <= :now
                 ORDER BY
                   enqueued_at ASC, task_id ASC
                 LIMIT
                   :max_items",
            )?;
            let rows = stmt.query_map(
                named_params! {
                    ":pending": i32::from(TaskStatus::Pending),
                    ":now": now_sql,
                    ":max_items": max_items as i64,
                },
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut reserved = Vec::with_capacity(candidates.len());
        {
            let mut update = tx.prepare(
                "UPDATE tasks
                 SET status = :in_progress, started_at = :now
                 WHERE task_id = :task_id",
            )?;
            for (task_id, payload, enqueued_at) in candidates {
                update.execute(named_params! {
                    ":in_progress": i32::from(TaskStatus::InProgress),
                    ":now": now_sql,
                    ":task_id": task_id,
                })?;
                reserved.push(ReservedTask {
                    enqueued_at: timestamp_from_sql(&enqueued_at)?,
                    task_id,
                    payload,
                });
            }
        }
        tx.commit()?;

        if !reserved.is_empty() {
            tracing::debug!("SqliteTaskStore.reserve: claimed {} task(s)", reserved.len());
        }
        Ok(reserved)
    }

    async fn mark_success(
        &self,
        task_id: &str,
        result_value: &[u8],
        finished_at: DateTime<Utc>,
    ) -> TaskDbResult<()> {
        let db = self.db.lock().unwrap();
        let updated = db.conn.execute(
            "UPDATE tasks
             SET status = :success, result_value = :result_value, finished_at = :finished_at
             WHERE task_id = :task_id AND status = :in_progress",
            named_params! {
                ":success": i32::from(TaskStatus::Success),
                ":result_value": result_value,
                ":finished_at": timestamp_to_sql(&finished_at),
                ":task_id": task_id,
                ":in_progress": i32::from(TaskStatus::InProgress),
            },
        )?;

        if updated == 0 {
            return Err(TaskDbError::StaleTransition {
                task_id: task_id.to_string(),
                found: Self::current_status(&db.conn, task_id)?,
            });
        }
        tracing::debug!("SqliteTaskStore.mark_success: {task_id}");
        Ok(())
    }

    async fn mark_failure(
        &self,
        task_id: &str,
        error: &str,
        traceback: &str,
        finished_at: DateTime<Utc>,
    ) -> TaskDbResult<()> {
        let db = self.db.lock().unwrap();
        let updated = db.conn.execute(
            "UPDATE tasks
             SET status = :failed, error = :error, traceback = :traceback,
                 finished_at = :finished_at
             WHERE task_id = :task_id AND status = :in_progress",
            named_params! {
                ":failed": i32::from(TaskStatus::Failed),
                ":error": error,
                ":traceback": traceback,
                ":finished_at": timestamp_to_sql(&finished_at),
                ":task_id": task_id,
                ":in_progress": i32::from(TaskStatus::InProgress),
            },
        )?;

        if updated == 0 {
            return Err(TaskDbError::StaleTransition {
                task_id: task_id.to_string(),
                found: Self::current_status(&db.conn, task_id)?,
            });
        }
        tracing::debug!("SqliteTaskStore.mark_failure: {task_id}: {error}");
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> TaskDbResult<Option<TaskRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.conn.prepare(
            "SELECT
               task_id, status, result_value, error, traceback,
               enqueued_at, started_at, finished_at
             FROM
               tasks
             WHERE
               task_id = :task_id",
        )?;
        let mut rows = stmt.query(named_params! { ":task_id": task_id })?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::record_from_row(row)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    // We only test private details here; the public API is exercised in the
    // dedicated tests folder.

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn error_on_missing() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("db.sqlite");
        assert!(TaskDb::open(&file).is_err());
    }

    #[test]
    fn create_then_reopen() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("db.sqlite");

        drop(TaskDb::open_or_create(&file).unwrap());
        drop(TaskDb::open_or_create(&file).unwrap());
    }

    #[test]
    fn refuse_newer_schema() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("db.sqlite");

        drop(TaskDb::open_or_create(&file).unwrap());

        let conn = Connection::open(&file).unwrap();
        conn.execute(
            "UPDATE metadata SET value = ? WHERE key = 'task_db_version'",
            [TASK_DB_VERSION + 1],
        )
        .unwrap();
        drop(conn);

        match TaskDb::open_or_create(&file) {
            Err(TaskDbError::SchemaVersion { found, supported }) => {
                assert_eq!(found, TASK_DB_VERSION + 1);
                assert_eq!(supported, TASK_DB_VERSION);
            }
            other => panic!("expected SchemaVersion error, got {other:?}"),
        }
    }

    #[test]
    fn timestamp_format_round_trip() {
        let now = Utc::now();
        let parsed = timestamp_from_sql(&timestamp_to_sql(&now)).unwrap();
        // Microsecond precision is what the column stores.
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn timestamp_format_is_fixed_width() {
        let a = timestamp_to_sql(&Utc::now());
        let b = timestamp_to_sql(&DateTime::<Utc>::from_timestamp(0, 0).unwrap());
        assert_eq!(a.len(), b.len());
    }
}
