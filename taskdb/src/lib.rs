//! # duraq task store
//!
//! Durable, transactional repository of queued tasks and their outcomes.
//! Producers insert `pending` rows, workers reserve and conclude them, and
//! everything coordinates through a single SQLite file, so independent
//! processes sharing that file act as one logical queue.
//!
//! ## Layout
//!
//!  __________________________
//! | metadata                |
//! |_________________________| A simple KV-store with the DB version for
//! | Key             | Value | migration/upgrade detection. Future versions
//! |_________________|_______| may add new keys without breaking older ones.
//! | task_db_version | 1     |
//! |_________________|_______|
//!
//!  _________________________
//! | Task status codes      |
//! |________________________|
//! | id      | desc         |
//! |_________|______________|
//! |     0   | success      |
//! |  1000   | pending      |
//! |  2000   | in_progress  |
//! | -1000   | failed       |
//! |_________|______________|
//!
//! Rationale:
//! - Convention, failures use negative status codes.
//! - We leave space for new status codes.
//!
//!  _____________________________________________________________________
//! | tasks                                                              |
//! |____________________________________________________________________|
//! | task_id | status | payload | enqueued_at | available_at            |
//! | started_at | finished_at | result_value | error | traceback        |
//! |____________________________________________________________________|
//!
//! One row per task; `payload` and `result_value` are opaque blobs owned
//! by the codec, the store never interprets them. An index over
//! `(status, available_at)` backs the reservation scan.
//!
//! ## State machine
//!
//! ```text
//!              reserve                 mark_success
//!   pending ────────────▶ in_progress ────────────▶ success   (terminal)
//!                              │
//!                              │ mark_failure
//!                              └───────────────────▶ failed    (terminal)
//! ```
//!
//! Terminal states are sticky: a `mark_*` against anything other than an
//! `in_progress` row is a no-op reported as [`TaskDbError::StaleTransition`].
//! Nothing here moves a stuck `in_progress` row back to `pending`; that is
//! an operator concern.

use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

#[cfg(feature = "in-memory")]
pub mod mem_db;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "in-memory")]
pub use mem_db::InMemoryTaskStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteTaskStore, TaskDb, TASK_DB_VERSION};

/// Opaque task identifier, generated by the producer at enqueue time and
/// never reused.
pub type TaskId = String;

#[rustfmt::skip]
#[derive(
    PartialEq, Eq, Debug, Clone, Copy, Hash, Serialize, Deserialize,
    IntoPrimitive, TryFromPrimitive,
)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success    = 0,
    Pending    = 1000,
    InProgress = 2000,
    Failed     = -1000,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

/// A task handed out by [`TaskStore::reserve`], already transitioned to
/// `in_progress` on behalf of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedTask {
    pub task_id: TaskId,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// Projection of one task row, as returned to producers polling for an
/// outcome.
///
/// Field nullability follows the status: `result_value` is only set on
/// `success`, `error`/`traceback` only on `failed`, `started_at` once the
/// task left `pending`, `finished_at` once it reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result_value: Option<Vec<u8>>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskDbError {
    #[error("task id already exists: {0}")]
    DuplicateTaskId(TaskId),

    /// A terminal write was attempted on a row that is not `in_progress`.
    /// The row is untouched.
    #[error("stale transition for task {task_id}: current status {found:?}")]
    StaleTransition {
        task_id: TaskId,
        found: Option<TaskStatus>,
    },

    /// The file was written by a newer library version than this one.
    #[error("task db version {found} is newer than supported version {supported}")]
    SchemaVersion { found: u32, supported: u32 },

    #[error("sql error: {0}")]
    Sql(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task db corruption: {0}")]
    Corrupted(String),
}

impl TaskDbError {
    /// Whether the store itself cannot serve requests, as opposed to a
    /// per-task contract violation the caller can absorb.
    pub fn is_unavailable(&self) -> bool {
        !matches!(
            self,
            TaskDbError::DuplicateTaskId(_) | TaskDbError::StaleTransition { .. }
        )
    }
}

pub type TaskDbResult<T> = Result<T, TaskDbError>;

/// The narrow set of operations workers and producers use to mutate and
/// observe tasks. Every method is one ACID transaction from the caller's
/// viewpoint.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `pending` row. `enqueued_at` is assigned by the store;
    /// `available_at` is clamped up to it so the row is never eligible
    /// before it exists.
    async fn enqueue(
        &self,
        task_id: &str,
        payload: &[u8],
        available_at: DateTime<Utc>,
    ) -> TaskDbResult<()>;

    /// Atomically claim up to `max_items` eligible rows
    /// (`pending` with `available_at <= now`), oldest first with ties
    /// broken on `task_id`, transitioning each to `in_progress`.
    ///
    /// Two concurrent reservers always obtain disjoint sets.
    async fn reserve(
        &self,
        max_items: usize,
        now: DateTime<Utc>,
    ) -> TaskDbResult<Vec<ReservedTask>>;

    /// Conclude an `in_progress` task as `success`.
    async fn mark_success(
        &self,
        task_id: &str,
        result_value: &[u8],
        finished_at: DateTime<Utc>,
    ) -> TaskDbResult<()>;

    /// Conclude an `in_progress` task as `failed`.
    async fn mark_failure(
        &self,
        task_id: &str,
        error: &str,
        traceback: &str,
        finished_at: DateTime<Utc>,
    ) -> TaskDbResult<()>;

    /// Read one task row; `None` if no such task. Does not mutate state.
    async fn get_result(&self, task_id: &str) -> TaskDbResult<Option<TaskRecord>>;
}
