use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use uuid::Uuid;

use super::types::{FailureDisposition, JobHandle, JobQueue, ScheduledJob};
use super::JobScheduler;

const JOB_STATUS_PENDING: &str = "pending";
const JOB_STATUS_RUNNING: &str = "running";
const JOB_STATUS_COMPLETED: &str = "completed";
const JOB_STATUS_FAILED: &str = "failed";
const JOB_STATUS_CANCELED: &str = "canceled";
const JOB_STATUS_DEAD_LETTERED: &str = "dead_lettered";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// How long a claim holds a job before another worker may take it over.
    pub lease: Duration,
}

impl RetryPolicy {
    /// `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            lease: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    payload: SqlJson<JsonValue>,
    run_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
}

impl JobRow {
    fn into_job(self) -> Option<ScheduledJob> {
        let Some(queue) = JobQueue::parse(&self.queue) else {
            tracing::warn!(job_id = %self.id, queue = %self.queue, "scheduled job has unknown queue");
            return None;
        };
        Some(ScheduledJob {
            handle: JobHandle::from(self.id),
            queue,
            payload: self.payload.0,
            run_at: self.run_at,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
        })
    }
}

/// Delayed job queue on `scheduled_jobs`, claimed with `SKIP LOCKED` so any
/// number of workers can share it.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    db: PgPool,
    retry: RetryPolicy,
}

impl PgJobQueue {
    pub fn new(db: PgPool, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Claims the oldest due job, or a `running` job whose lease expired
    /// because its worker died mid-run.
    pub async fn claim_next_due(&self, queue: JobQueue) -> Result<Option<ScheduledJob>, sqlx::Error> {
        let mut tx = self.db.begin().await?;
        let claimed: Option<JobRow> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT id
                FROM scheduled_jobs
                WHERE queue = $1
                  AND (
                    (status = $2 AND run_at <= now())
                    OR (status = $3 AND started_at < now() - make_interval(secs => $4))
                  )
                ORDER BY run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scheduled_jobs
            SET status = $3,
                attempts = attempts + 1,
                started_at = now(),
                updated_at = now()
            WHERE id IN (SELECT id FROM next)
            RETURNING id, queue, payload, run_at, attempts, max_attempts
            "#,
        )
        .bind(queue.as_str())
        .bind(JOB_STATUS_PENDING)
        .bind(JOB_STATUS_RUNNING)
        .bind(self.retry.lease.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(claimed.and_then(JobRow::into_job))
    }

    pub async fn mark_completed(
        &self,
        job: &ScheduledJob,
        result: &JsonValue,
    ) -> Result<(), sqlx::Error> {
        let Some(id) = job.handle.as_uuid() else {
            return Ok(());
        };
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = $2,
                result = $3,
                last_error = NULL,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(JOB_STATUS_COMPLETED)
        .bind(SqlJson(result))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Re-queues with backoff while attempts remain, otherwise fails the job
    /// (parking aggregation jobs in `dead_letter_jobs`).
    pub async fn mark_failed(
        &self,
        job: &ScheduledJob,
        error: &str,
    ) -> Result<FailureDisposition, sqlx::Error> {
        let Some(id) = job.handle.as_uuid() else {
            return Ok(FailureDisposition::Failed);
        };

        if job.attempts < job.max_attempts {
            let delay = chrono::Duration::from_std(self.retry.backoff(job.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            let run_at = Utc::now() + delay;
            sqlx::query(
                r#"
                UPDATE scheduled_jobs
                SET status = $2,
                    run_at = $3,
                    last_error = $4,
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(JOB_STATUS_PENDING)
            .bind(run_at)
            .bind(error)
            .execute(&self.db)
            .await?;
            return Ok(FailureDisposition::Retrying { run_at });
        }

        let mut tx = self.db.begin().await?;
        let disposition = if job.queue.dead_letters() {
            sqlx::query(
                r#"
                INSERT INTO dead_letter_jobs (job_id, queue, payload, attempts, last_error, failed_at)
                VALUES ($1, $2, $3, $4, $5, now())
                "#,
            )
            .bind(id)
            .bind(job.queue.as_str())
            .bind(SqlJson(&job.payload))
            .bind(job.attempts)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            FailureDisposition::DeadLettered
        } else {
            FailureDisposition::Failed
        };
        let status = match disposition {
            FailureDisposition::DeadLettered => JOB_STATUS_DEAD_LETTERED,
            _ => JOB_STATUS_FAILED,
        };
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = $2,
                last_error = $3,
                completed_at = now(),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(disposition)
    }

    /// Moves a dead-lettered job back onto its queue with a fresh attempt budget.
    pub async fn retry_dead_letter(&self, handle: &JobHandle) -> Result<bool, sqlx::Error> {
        let Some(id) = handle.as_uuid() else {
            return Ok(false);
        };
        let mut tx = self.db.begin().await?;
        let removed = sqlx::query("DELETE FROM dead_letter_jobs WHERE job_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = $2,
                attempts = 0,
                run_at = now(),
                last_error = NULL,
                completed_at = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(JOB_STATUS_PENDING)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl JobScheduler for PgJobQueue {
    async fn schedule(
        &self,
        queue: JobQueue,
        payload: JsonValue,
        delay: Duration,
    ) -> Result<JobHandle> {
        let delay = chrono::Duration::from_std(delay)?;
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs
                (id, queue, status, payload, run_at, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, now(), now())
            "#,
        )
        .bind(id)
        .bind(queue.as_str())
        .bind(JOB_STATUS_PENDING)
        .bind(SqlJson(&payload))
        .bind(Utc::now() + delay)
        .bind(self.retry.max_attempts.max(1))
        .execute(&self.db)
        .await?;
        Ok(JobHandle::from(id))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let Some(id) = handle.as_uuid() else {
            return Ok(false);
        };
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = $2,
                updated_at = now()
            WHERE id = $1
              AND status = $3
            "#,
        )
        .bind(id)
        .bind(JOB_STATUS_CANCELED)
        .bind(JOB_STATUS_PENDING)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn pending(&self, queue: JobQueue) -> Result<Vec<ScheduledJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT id, queue, payload, run_at, attempts, max_attempts
            FROM scheduled_jobs
            WHERE queue = $1
              AND status = $2
            ORDER BY run_at ASC
            "#,
        )
        .bind(queue.as_str())
        .bind(JOB_STATUS_PENDING)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().filter_map(JobRow::into_job).collect())
    }
}
