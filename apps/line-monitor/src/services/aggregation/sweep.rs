use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::RecalculatePayload;
use crate::services::jobs::{JobQueue, JobScheduler};

/// Periodically enqueues a sweep for jobs that have no episodes yet.
pub struct AggregationSweepService {
    scheduler: Arc<dyn JobScheduler>,
    interval: Duration,
}

impl AggregationSweepService {
    pub fn new(scheduler: Arc<dyn JobScheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = self.enqueue().await {
                    tracing::warn!(error = %err, "failed to enqueue aggregation sweep");
                }
            }
        });
    }

    async fn enqueue(&self) -> anyhow::Result<()> {
        if !self
            .scheduler
            .pending(JobQueue::AggregationRecalculate)
            .await?
            .iter()
            .any(|job| job.payload.get("job_id").map_or(true, |id| id.is_null()))
        {
            let payload = serde_json::to_value(RecalculatePayload::default())?;
            let handle = self
                .scheduler
                .schedule(JobQueue::AggregationRecalculate, payload, Duration::ZERO)
                .await?;
            tracing::debug!(job_id = %handle, "aggregation sweep enqueued");
        }
        Ok(())
    }
}
