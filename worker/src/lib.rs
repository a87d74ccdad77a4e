//! Consumer-side runtime: a single dispatcher loop reserves batches of
//! tasks from the store and launches one concurrent executor per task,
//! capped by a semaphore. Executors decode the payload, run the registered
//! handler, and record the outcome; a failing task is data, not a worker
//! fault. Shutdown is one-way: once signalled the dispatcher reserves
//! nothing further and the worker returns after in-flight executors drain.

mod config;
mod handler;
mod worker;

pub use config::WorkerConfig;
pub use handler::{HandlerRegistry, TaskHandler};
pub use worker::Worker;
