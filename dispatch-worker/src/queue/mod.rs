//! Durable batch queue.
//!
//! ```text
//! Scheduler → queue_jobs (SQLite) ─┬→ Dispatch Worker
//!           → campaign_batches (RabbitMQ wake-up) ┘
//! ```
//!
//! The table is the source of truth; the RabbitMQ notification only shortens
//! the time until an idle worker polls.

pub mod publisher;
pub mod store;
pub mod types;

pub use publisher::{declare_batch_queue, Publisher};
pub use store::JobQueue;
pub use types::{
    BatchReady, BatchStatus, FailOutcome, JobPayload, JobProgress, JobState, QueueJob, Retention,
    RetryPolicy, BATCH_QUEUE,
};
