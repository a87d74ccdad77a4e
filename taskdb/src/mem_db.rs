//! In-memory task store with the same observable semantics as the SQLite
//! one. Useful for tests and for embedding an ephemeral single-process
//! queue; nothing survives a restart.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};

use crate::{ReservedTask, TaskDbError, TaskDbResult, TaskRecord, TaskStatus, TaskStore};

#[derive(Debug, Clone)]
struct TaskRow {
    status: TaskStatus,
    payload: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result_value: Option<Vec<u8>>,
    error: Option<String>,
    traceback: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<Mutex<HashMap<String, TaskRow>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(
        &self,
        task_id: &str,
        payload: &[u8],
        available_at: DateTime<Utc>,
    ) -> TaskDbResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(task_id) {
            return Err(TaskDbError::DuplicateTaskId(task_id.to_string()));
        }
        let enqueued_at = Utc::now();
        tasks.insert(
            task_id.to_string(),
            TaskRow {
                status: TaskStatus::Pending,
                payload: payload.to_vec(),
                enqueued_at,
                available_at: available_at.max(enqueued_at),
                started_at: None,
                finished_at: None,
                result_value: None,
                error: None,
                traceback: None,
            },
        );
        Ok(())
    }

    async fn reserve(
        &self,
        max_items: usize,
        now: DateTime<Utc>,
    ) -> TaskDbResult<Vec<ReservedTask>> {
        let mut tasks = self.tasks.lock().unwrap();

        let mut eligible: Vec<(DateTime<Utc>, String)> = tasks
            .iter()
            .filter(|(_, row)| row.status == TaskStatus::Pending && row.available_at <= now)
            .map(|(task_id, row)| (row.enqueued_at, task_id.clone()))
            .collect();
        eligible.sort();
        eligible.truncate(max_items);

        let mut reserved = Vec::with_capacity(eligible.len());
        for (_, task_id) in eligible {
            let row = tasks.get_mut(&task_id).unwrap();
            row.status = TaskStatus::InProgress;
            row.started_at = Some(now);
            reserved.push(ReservedTask {
                task_id,
                payload: row.payload.clone(),
                enqueued_at: row.enqueued_at,
            });
        }
        Ok(reserved)
    }

    async fn mark_success(
        &self,
        task_id: &str,
        result_value: &[u8],
        finished_at: DateTime<Utc>,
    ) -> TaskDbResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let row = match tasks.get_mut(task_id) {
            Some(row) if row.status == TaskStatus::InProgress => row,
            other => {
                return Err(TaskDbError::StaleTransition {
                    task_id: task_id.to_string(),
                    found: other.map(|row| row.status),
                })
            }
        };
        row.status = TaskStatus::Success;
        row.result_value = Some(result_value.to_vec());
        row.finished_at = Some(finished_at);
        Ok(())
    }

    async fn mark_failure(
        &self,
        task_id: &str,
        error: &str,
        traceback: &str,
        finished_at: DateTime<Utc>,
    ) -> TaskDbResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let row = match tasks.get_mut(task_id) {
            Some(row) if row.status == TaskStatus::InProgress => row,
            other => {
                return Err(TaskDbError::StaleTransition {
                    task_id: task_id.to_string(),
                    found: other.map(|row| row.status),
                })
            }
        };
        row.status = TaskStatus::Failed;
        row.error = Some(error.to_string());
        row.traceback = Some(traceback.to_string());
        row.finished_at = Some(finished_at);
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> TaskDbResult<Option<TaskRecord>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks.get(task_id).map(|row| TaskRecord {
            task_id: task_id.to_string(),
            status: row.status,
            result_value: row.result_value.clone(),
            error: row.error.clone(),
            traceback: row.traceback.clone(),
            enqueued_at: row.enqueued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        }))
    }
}
