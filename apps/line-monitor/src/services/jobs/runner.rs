use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::store::PgJobQueue;
use super::types::{FailureDisposition, JobQueue, ScheduledJob};

/// Executes one claimed job. `Err` triggers the queue's retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ScheduledJob) -> Result<JsonValue>;
}

pub struct JobWorker {
    queue: Arc<PgJobQueue>,
    kind: JobQueue,
    handler: Arc<dyn JobHandler>,
    semaphore: Arc<Semaphore>,
    concurrency: u32,
    poll_interval: Duration,
}

impl JobWorker {
    pub fn new(
        queue: Arc<PgJobQueue>,
        kind: JobQueue,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        let concurrency = u32::try_from(concurrency.max(1)).unwrap_or(u32::MAX);
        Self {
            queue,
            kind,
            handler,
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            concurrency,
            poll_interval,
        }
    }

    /// Polls until `cancel` fires, then waits for in-flight jobs before the
    /// returned task completes.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                queue = %self.kind,
                concurrency = self.concurrency,
                poll_interval_ms = self.poll_interval.as_millis() as u64,
                "job worker started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }

                while let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                    let job = match self.queue.claim_next_due(self.kind).await {
                        Ok(job) => job,
                        Err(err) => {
                            tracing::warn!(queue = %self.kind, error = %err, "job worker failed to claim job");
                            drop(permit);
                            break;
                        }
                    };

                    let Some(job) = job else {
                        drop(permit);
                        break;
                    };

                    let worker = self.clone();
                    let span = tracing::info_span!(
                        "scheduled_job",
                        queue = %job.queue,
                        job_id = %job.handle,
                        attempt = job.attempts,
                    );
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = worker.run_one(job).instrument(span).await {
                            tracing::warn!(error = %err, "job worker bookkeeping error");
                        }
                    });
                }
            }
            let in_flight = (self.concurrency as usize).saturating_sub(self.semaphore.available_permits());
            if in_flight > 0 {
                tracing::info!(queue = %self.kind, in_flight, "waiting for running jobs");
            }
            wait_for_idle(&self.semaphore, self.concurrency).await;
            tracing::info!(queue = %self.kind, "job worker stopped");
        })
    }

    async fn run_one(&self, job: ScheduledJob) -> Result<()> {
        let started = Instant::now();
        let outcome = if job.attempts_exhausted() {
            Err(anyhow::anyhow!("lease expired on the final attempt"))
        } else {
            run_handler(self.handler.clone(), job.clone()).await
        };
        match outcome {
            Ok(result) => {
                self.queue.mark_completed(&job, &result).await?;
                tracing::debug!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
            }
            Err(err) => {
                let message = format!("{err:#}");
                match self.queue.mark_failed(&job, &message).await? {
                    FailureDisposition::Retrying { run_at } => {
                        tracing::warn!(error = %message, retry_at = %run_at, "job failed; will retry");
                    }
                    FailureDisposition::DeadLettered => {
                        tracing::error!(error = %message, "job exhausted retries; moved to dead letter");
                    }
                    FailureDisposition::Failed => {
                        tracing::error!(error = %message, "job exhausted retries");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Runs the handler on its own task so a panic surfaces as a job error
/// instead of leaving the row `running`.
pub(crate) async fn run_handler(
    handler: Arc<dyn JobHandler>,
    job: ScheduledJob,
) -> Result<JsonValue> {
    let task = tokio::spawn(async move { handler.handle(&job).await }.in_current_span());
    match task.await {
        Ok(outcome) => outcome,
        Err(err) => Err(anyhow::anyhow!("job handler {}", join_failure(err))),
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return "was cancelled".to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("panicked: {message}")
}

async fn wait_for_idle(semaphore: &Semaphore, permits: u32) {
    if let Ok(all) = semaphore.acquire_many(permits).await {
        drop(all);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::jobs::{JobHandle, JobQueue};
    use chrono::Utc;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &ScheduledJob) -> Result<JsonValue> {
            Ok(job.payload.clone())
        }
    }

    struct Exploding;

    #[async_trait]
    impl JobHandler for Exploding {
        async fn handle(&self, job: &ScheduledJob) -> Result<JsonValue> {
            panic!("bad payload for {}", job.handle);
        }
    }

    fn job() -> ScheduledJob {
        ScheduledJob {
            handle: JobHandle("job-7".to_string()),
            queue: JobQueue::EscalationCheck,
            payload: serde_json::json!({"notification_id": 1}),
            run_at: Utc::now(),
            attempts: 1,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn handler_results_pass_through() {
        let result = run_handler(Arc::new(Echo), job()).await.expect("handled");
        assert_eq!(result, serde_json::json!({"notification_id": 1}));
    }

    #[tokio::test]
    async fn handler_panic_becomes_a_job_error() {
        let err = run_handler(Arc::new(Exploding), job())
            .await
            .expect_err("panic must fail the job");
        assert_eq!(
            err.to_string(),
            "job handler panicked: bad payload for job-7"
        );
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_jobs() {
        let semaphore = Arc::new(Semaphore::new(2));
        let held = semaphore.clone().acquire_owned().await.expect("permit");
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let _held = held;
            let _ = released.await;
        });

        let early = tokio::time::timeout(Duration::from_millis(50), wait_for_idle(&semaphore, 2)).await;
        assert!(early.is_err());

        release.send(()).expect("job still running");
        tokio::time::timeout(Duration::from_secs(5), wait_for_idle(&semaphore, 2))
            .await
            .expect("idle after the job finished");
        assert_eq!(semaphore.available_permits(), 2);
    }
}
