//! Producer-side façade over the task store: create task rows, poll for
//! their outcomes. Safe to clone and share between concurrent producers;
//! all operations delegate to the store's own concurrency discipline.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use duraq_codec::{CallSpec, Codec, CodecError};
use duraq_taskdb::{TaskDbError, TaskId, TaskRecord, TaskStore};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] TaskDbError),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn TaskStore>,
    codec: Arc<dyn Codec>,
}

impl Client {
    pub fn new(store: Arc<dyn TaskStore>, codec: Arc<dyn Codec>) -> Self {
        Self { store, codec }
    }

    /// Queue one handler call. Returns the fresh opaque task id.
    ///
    /// `eta`, when given, is the earliest instant the task becomes eligible
    /// for reservation; otherwise the task is eligible immediately. A
    /// failing encode aborts the enqueue, nothing is written.
    pub async fn enqueue(
        &self,
        call: CallSpec,
        eta: Option<DateTime<Utc>>,
    ) -> ClientResult<TaskId> {
        if call.handler.is_empty() {
            return Err(ClientError::InvalidArgument(
                "handler name must not be empty".to_string(),
            ));
        }

        let payload = self.codec.encode_call(&call)?;
        let task_id = Uuid::new_v4().to_string();
        let available_at = eta.unwrap_or_else(Utc::now);

        self.store.enqueue(&task_id, &payload, available_at).await?;
        tracing::debug!("Client.enqueue: {task_id} handler={}", call.handler);
        Ok(task_id)
    }

    /// Fetch a task's current projection.
    ///
    /// With no timeout (or a zero one) this is a single snapshot: whatever
    /// the row looks like right now, or `None` if there is no such task.
    /// With a timeout the call polls until the task reaches a terminal
    /// status, returning `None` if it does not within the budget. A failed
    /// task is a normal return; the failure lives inside the record.
    pub async fn get_result(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> ClientResult<Option<TaskRecord>> {
        let timeout = timeout.unwrap_or(Duration::ZERO);
        if timeout.is_zero() {
            return Ok(self.store.get_result(task_id).await?);
        }

        let interval = poll_interval(timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.store.get_result(task_id).await? {
                if record.status.is_terminal() {
                    return Ok(Some(record));
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Release the underlying store handle. Dropping the client has the
    /// same effect; this form just makes the intent explicit.
    pub fn close(self) {}
}

/// Poll at a twentieth of the budget, but never tighter than 50ms nor
/// looser than a second.
fn poll_interval(timeout: Duration) -> Duration {
    (timeout / 20).clamp(Duration::from_millis(50), Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use duraq_codec::JsonCodec;
    use duraq_taskdb::{InMemoryTaskStore, TaskStatus};
    use serde_json::json;

    fn client_over(store: &InMemoryTaskStore) -> Client {
        Client::new(Arc::new(store.clone()), Arc::new(JsonCodec))
    }

    #[test]
    fn poll_interval_bounds() {
        assert_eq!(
            poll_interval(Duration::from_millis(100)),
            Duration::from_millis(50)
        );
        assert_eq!(poll_interval(Duration::from_secs(10)), Duration::from_millis(500));
        assert_eq!(poll_interval(Duration::from_secs(60)), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn empty_handler_is_rejected() {
        let store = InMemoryTaskStore::new();
        let client = client_over(&store);

        let err = client.enqueue(CallSpec::default(), None).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn snapshot_returns_non_terminal_row() {
        let store = InMemoryTaskStore::new();
        let client = client_over(&store);

        let task_id = client
            .enqueue(CallSpec::new("noop").with_args(vec![json!(1)]), None)
            .await
            .unwrap();

        let record = client.get_result(&task_id, None).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_task_is_none() {
        let store = InMemoryTaskStore::new();
        let client = client_over(&store);
        assert!(client.get_result("nope", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn polling_returns_once_terminal() {
        let store = InMemoryTaskStore::new();
        let client = client_over(&store);

        let task_id = client.enqueue(CallSpec::new("noop"), None).await.unwrap();

        // Conclude the task from the side while the client polls.
        let concluder = tokio::spawn({
            let store = store.clone();
            let task_id = task_id.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                store.reserve(1, Utc::now()).await.unwrap();
                store.mark_success(&task_id, b"null", Utc::now()).await.unwrap();
            }
        });

        let record = client
            .get_result(&task_id, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        concluder.await.unwrap();
    }

    #[tokio::test]
    async fn polling_expires_to_none() {
        let store = InMemoryTaskStore::new();
        let client = client_over(&store);

        let task_id = client.enqueue(CallSpec::new("noop"), None).await.unwrap();
        let record = client
            .get_result(&task_id, Some(Duration::from_millis(150)))
            .await
            .unwrap();
        assert!(record.is_none());
    }
}
