use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use duraq_codec::Codec;
use duraq_taskdb::{ReservedTask, TaskDbError, TaskId, TaskStore};
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{HandlerRegistry, WorkerConfig};

/// Consecutive reservation failures tolerated before the worker gives up
/// and drains.
const MAX_STORE_FAILURES: u32 = 5;
/// Ceiling on the reservation retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Running,
    Stopped,
}

/// The failure half of a task outcome: a short message plus a multi-line
/// diagnostic, both persisted on the row.
struct TaskFailure {
    error: String,
    traceback: String,
}

pub struct Worker {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    codec: Arc<dyn Codec>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    /// Task ids with a live executor; maintained by the dispatcher and used
    /// only for drain tracking, never for reservation decisions.
    running: Mutex<HashSet<TaskId>>,
    stopping: AtomicBool,
    /// Wakes the dispatcher out of its saturation wait or idle sleep, on
    /// executor completion and on stop.
    wakeup: Notify,
    lifecycle: watch::Sender<Lifecycle>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        codec: Arc<dyn Codec>,
        handlers: HandlerRegistry,
        config: WorkerConfig,
    ) -> anyhow::Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let (lifecycle, _) = watch::channel(Lifecycle::New);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                codec,
                handlers: Arc::new(handlers),
                config,
                semaphore,
                running: Mutex::new(HashSet::new()),
                stopping: AtomicBool::new(false),
                wakeup: Notify::new(),
                lifecycle,
            }),
        })
    }

    /// Begin dispatching. Non-blocking; the dispatcher runs as its own
    /// task. Calling `start` again (or after `stop`) is a no-op.
    pub fn start(&self) {
        let mut started = false;
        self.inner.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::New {
                *state = Lifecycle::Running;
                started = true;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.dispatch().await;
        });
    }

    /// Graceful shutdown: stop reserving, let in-flight executors run to
    /// completion (including their terminal mark), then return. Idempotent;
    /// every caller blocks until the worker has drained.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_one();

        // A worker that never started has nothing to drain.
        self.inner.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::New {
                *state = Lifecycle::Stopped;
                true
            } else {
                false
            }
        });

        let mut rx = self.inner.lifecycle.subscribe();
        loop {
            if *rx.borrow_and_update() == Lifecycle::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of tasks with a live executor right now.
    pub fn running_count(&self) -> usize {
        self.inner.running.lock().unwrap().len()
    }
}

impl Inner {
    async fn dispatch(self: Arc<Self>) {
        info!("Worker dispatcher started");
        // Executors report completion over this channel; capacity matches
        // the concurrency ceiling so sends never block.
        let (done_tx, mut done_rx) = mpsc::channel::<TaskId>(self.config.max_concurrency);
        let mut consecutive_failures: u32 = 0;

        while !self.stopping.load(Ordering::SeqCst) {
            // Fold in executors that finished since the last pass.
            while let Ok(task_id) = done_rx.try_recv() {
                self.running.lock().unwrap().remove(&task_id);
            }

            let free = self.semaphore.available_permits();
            if free == 0 {
                // Saturated: wait for an executor to finish or for stop().
                self.wakeup.notified().await;
                continue;
            }

            let batch = self.config.batch_size.min(free);
            let reserved = match self.store.reserve(batch, Utc::now()).await {
                Ok(reserved) => {
                    consecutive_failures = 0;
                    reserved
                }
                Err(err) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_STORE_FAILURES {
                        error!(
                            "Worker store unavailable after {consecutive_failures} attempts, \
                             shutting down: {err}"
                        );
                        self.stopping.store(true, Ordering::SeqCst);
                        break;
                    }
                    let delay = backoff_delay(self.config.poll_interval(), consecutive_failures);
                    warn!(
                        "Worker failed to reserve tasks (attempt {consecutive_failures}): {err}, \
                         retrying in {delay:?}"
                    );
                    self.idle_sleep(delay).await;
                    continue;
                }
            };

            if reserved.is_empty() {
                self.idle_sleep(self.config.poll_interval()).await;
                continue;
            }

            for task in reserved {
                // The dispatcher is the only acquirer and checked the free
                // count above, so this never waits for long.
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Worker semaphore closed, stopping dispatcher");
                        self.stopping.store(true, Ordering::SeqCst);
                        break;
                    }
                };
                self.running.lock().unwrap().insert(task.task_id.clone());

                let inner = self.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    inner.execute(task, permit, done_tx).await;
                });
            }
        }

        // Drain: no further reservations; wait out in-flight executors.
        drop(done_tx);
        while let Some(task_id) = done_rx.recv().await {
            self.running.lock().unwrap().remove(&task_id);
            let remaining = self.running.lock().unwrap().len();
            if remaining > 0 {
                debug!("Worker draining, {remaining} task(s) in flight");
            }
        }

        info!("Worker dispatcher stopped");
        self.lifecycle.send_if_modified(|state| {
            if *state != Lifecycle::Stopped {
                *state = Lifecycle::Stopped;
                true
            } else {
                false
            }
        });
    }

    /// Sleep, but wake early on executor completion or stop.
    async fn idle_sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wakeup.notified() => {}
        }
    }

    /// Run one reserved task to a recorded outcome. Never propagates the
    /// task's failure; the dispatcher only learns "done".
    async fn execute(
        &self,
        task: ReservedTask,
        permit: OwnedSemaphorePermit,
        done_tx: mpsc::Sender<TaskId>,
    ) {
        let _permit = permit;
        let task_id = task.task_id.clone();

        match self.run_task(task).await {
            Ok(encoded) => {
                match self.store.mark_success(&task_id, &encoded, Utc::now()).await {
                    Ok(()) => debug!("Worker finished task {task_id}"),
                    Err(TaskDbError::StaleTransition { found, .. }) => warn!(
                        "Worker finished task {task_id}, but it was already \
                         concluded elsewhere (status {found:?})"
                    ),
                    Err(err) => {
                        error!("Worker failed to record success of task {task_id}: {err}")
                    }
                }
            }
            Err(failure) => {
                info!("Worker recording failure of task {task_id}: {}", failure.error);
                match self
                    .store
                    .mark_failure(&task_id, &failure.error, &failure.traceback, Utc::now())
                    .await
                {
                    Ok(()) => {}
                    Err(TaskDbError::StaleTransition { found, .. }) => warn!(
                        "Worker failed task {task_id}, but it was already \
                         concluded elsewhere (status {found:?})"
                    ),
                    Err(err) => {
                        error!("Worker failed to record failure of task {task_id}: {err}")
                    }
                }
            }
        }

        let _ = done_tx.send(task_id).await;
        self.wakeup.notify_one();
    }

    async fn run_task(&self, task: ReservedTask) -> Result<Vec<u8>, TaskFailure> {
        let call = match self.codec.decode_call(&task.payload) {
            Ok(call) => call,
            Err(err) => {
                return Err(TaskFailure {
                    error: "payload decode failed".to_string(),
                    traceback: format!("{err:?}"),
                })
            }
        };

        let handler = match self.handlers.get(&call.handler) {
            Some(handler) => handler,
            None => {
                return Err(TaskFailure {
                    error: format!("unknown handler: {}", call.handler),
                    traceback: format!(
                        "no handler registered under {:?}\nregistered handlers: {:?}",
                        call.handler,
                        self.handlers.names()
                    ),
                })
            }
        };

        // The handler runs in a task of its own so a panic surfaces as a
        // JoinError here instead of tearing down the executor.
        let invocation = tokio::spawn(async move { handler.run(call).await });
        let value = match invocation.await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                return Err(TaskFailure {
                    error: err.to_string(),
                    traceback: format!("{err:?}"),
                })
            }
            Err(join_err) if join_err.is_panic() => {
                return Err(TaskFailure {
                    error: "task panicked".to_string(),
                    traceback: panic_message(join_err),
                })
            }
            Err(join_err) => {
                return Err(TaskFailure {
                    error: "task aborted".to_string(),
                    traceback: join_err.to_string(),
                })
            }
        };

        match self.codec.encode_value(&value) {
            Ok(encoded) => Ok(encoded),
            Err(err) => Err(TaskFailure {
                error: "result encode failed".to_string(),
                traceback: format!("{err:?}"),
            }),
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(5);
    (base * factor).min(MAX_BACKOFF)
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(panic) => {
            let message = if let Some(message) = panic.downcast_ref::<&str>() {
                (*message).to_string()
            } else if let Some(message) = panic.downcast_ref::<String>() {
                message.clone()
            } else {
                "non-string panic payload".to_string()
            };
            format!("handler panicked:\n{message}")
        }
        Err(err) => err.to_string(),
    }
}
