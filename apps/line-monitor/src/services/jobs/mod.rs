use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;

mod runner;
mod store;
mod types;

pub use runner::{JobHandler, JobWorker};
pub use store::{PgJobQueue, RetryPolicy};
pub use types::{FailureDisposition, JobHandle, JobQueue, ScheduledJob};

/// Durable delayed-job scheduling. Delivery is at-least-once, so handlers
/// re-validate everything when they run.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, queue: JobQueue, payload: JsonValue, delay: Duration)
        -> Result<JobHandle>;

    /// Cancels a job that has not started yet; `false` when it was already
    /// claimed, finished, or unknown.
    async fn cancel(&self, handle: &JobHandle) -> Result<bool>;

    async fn pending(&self, queue: JobQueue) -> Result<Vec<ScheduledJob>>;
}
