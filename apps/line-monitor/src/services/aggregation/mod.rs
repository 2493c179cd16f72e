use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use crate::services::episodes::{
    alarm_episodes, state_episodes, AlarmEpisode, EpisodeContext, EpisodeKind,
    MachineStateEpisode, TagSample,
};
use crate::services::jobs::{JobHandler, ScheduledJob};

mod annotations;
mod efficiency;
mod store;
mod sweep;

pub use annotations::{AnnotationKey, AnnotationSnapshot};
pub use efficiency::{EfficiencyError, EfficiencyRecalculator, HttpEfficiencyRecalculator};
pub use store::PgEpisodeRepository;
pub use sweep::AggregationSweepService;

/// One line/machine/tag whose long alarms are known bad data and dropped after
/// segmentation. Not a general rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarveOut {
    pub line_id: i64,
    pub machine_id: i64,
    pub tag_id: i64,
    pub max_minutes: f64,
}

// TODO: remove once the line 2 capper alarm word (tag 342) is rewired.
pub const LONG_ALARM_CARVE_OUT: CarveOut = CarveOut {
    line_id: 2,
    machine_id: 17,
    tag_id: 342,
    max_minutes: 120.0,
};

impl CarveOut {
    fn drops(&self, episode: &AlarmEpisode) -> bool {
        episode.line_id == self.line_id
            && episode.machine_id == self.machine_id
            && episode.tag_id == self.tag_id
            && episode.duration_minutes > self.max_minutes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionJob {
    pub id: i64,
    pub line_id: i64,
    pub line_name: String,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
}

impl ProductionJob {
    pub fn window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.actual_start_time, self.actual_end_time) {
            (Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRef {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineTags {
    pub machine_id: i64,
    pub machine_name: String,
    pub alarm_tags: Vec<TagRef>,
    pub state_tag: Option<TagRef>,
}

#[async_trait]
pub trait SampleReader: Send + Sync {
    /// Samples with `from <= timestamp <= to`, ascending.
    async fn samples(
        &self,
        tag_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TagSample>>;
}

#[async_trait]
pub trait JobDirectory: Send + Sync {
    async fn get_job(&self, job_id: i64) -> Result<Option<ProductionJob>>;
    async fn line_machines(&self, line_id: i64) -> Result<Vec<MachineTags>>;
    async fn jobs_needing_aggregation(&self, kind: EpisodeKind) -> Result<Vec<i64>>;
}

#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn annotated_alarm_episodes(&self, job_id: i64) -> Result<Vec<AlarmEpisode>>;
    /// Currently stored episodes of the job limited to the given tags.
    async fn stored_tag_episodes(
        &self,
        job_id: i64,
        alarm_tags: &[i64],
        state_tags: &[i64],
    ) -> Result<(Vec<AlarmEpisode>, Vec<MachineStateEpisode>)>;
    /// Deletes every alarm and state episode of the job and inserts the given
    /// sets, atomically.
    async fn replace_job_episodes(
        &self,
        job_id: i64,
        alarms: &[AlarmEpisode],
        states: &[MachineStateEpisode],
    ) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("job {0} not found")]
    JobNotFound(i64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobAggregation {
    pub job_id: i64,
    pub alarm_episodes: usize,
    pub state_episodes: usize,
    pub annotations_restored: usize,
    pub suppressed: usize,
    pub carved_out: usize,
    pub skipped_tags: usize,
    /// Stored episodes kept as-is because their tag could not be read.
    pub carried_forward: usize,
    pub skipped_no_window: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationReport {
    pub jobs: Vec<JobAggregation>,
    pub failed_jobs: Vec<i64>,
}

impl AggregationReport {
    pub fn alarm_episodes(&self) -> usize {
        self.jobs.iter().map(|job| job.alarm_episodes).sum()
    }

    pub fn state_episodes(&self) -> usize {
        self.jobs.iter().map(|job| job.state_episodes).sum()
    }
}

#[derive(Clone)]
pub struct AggregationService {
    samples: Arc<dyn SampleReader>,
    jobs: Arc<dyn JobDirectory>,
    episodes: Arc<dyn EpisodeStore>,
    efficiency: Option<Arc<dyn EfficiencyRecalculator>>,
}

impl AggregationService {
    pub fn new(
        samples: Arc<dyn SampleReader>,
        jobs: Arc<dyn JobDirectory>,
        episodes: Arc<dyn EpisodeStore>,
        efficiency: Option<Arc<dyn EfficiencyRecalculator>>,
    ) -> Self {
        Self {
            samples,
            jobs,
            episodes,
            efficiency,
        }
    }

    /// Rebuilds episodes for one job, or for every job missing from the
    /// episode tables when `job_id` is `None`.
    pub async fn recalculate(
        &self,
        job_id: Option<i64>,
    ) -> Result<AggregationReport, AggregationError> {
        let mut report = AggregationReport::default();

        if let Some(job_id) = job_id {
            report.jobs.push(self.recalculate_job(job_id).await?);
            return Ok(report);
        }

        let mut pending: BTreeSet<i64> = BTreeSet::new();
        pending.extend(self.jobs.jobs_needing_aggregation(EpisodeKind::Alarm).await?);
        pending.extend(self.jobs.jobs_needing_aggregation(EpisodeKind::State).await?);
        if pending.is_empty() {
            return Ok(report);
        }
        tracing::info!(jobs = pending.len(), "aggregation sweep started");

        for job_id in pending {
            match self.recalculate_job(job_id).await {
                Ok(job) => report.jobs.push(job),
                Err(err) => {
                    tracing::warn!(job_id, error = %err, "job aggregation failed");
                    report.failed_jobs.push(job_id);
                }
            }
        }

        tracing::info!(
            jobs = report.jobs.len(),
            failed = report.failed_jobs.len(),
            alarm_episodes = report.alarm_episodes(),
            state_episodes = report.state_episodes(),
            "aggregation sweep finished"
        );
        Ok(report)
    }

    async fn recalculate_job(&self, job_id: i64) -> Result<JobAggregation, AggregationError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(AggregationError::JobNotFound(job_id))?;

        let mut summary = JobAggregation {
            job_id,
            ..JobAggregation::default()
        };
        let Some((start, end)) = job.window() else {
            tracing::info!(job_id, "job has no completed run window; skipping aggregation");
            summary.skipped_no_window = true;
            return Ok(summary);
        };

        let snapshot =
            AnnotationSnapshot::from_episodes(self.episodes.annotated_alarm_episodes(job_id).await?);

        let mut alarms: Vec<AlarmEpisode> = Vec::new();
        let mut states: Vec<MachineStateEpisode> = Vec::new();
        let mut unread_alarm_tags: Vec<i64> = Vec::new();
        let mut unread_state_tags: Vec<i64> = Vec::new();

        for machine in self.jobs.line_machines(job.line_id).await? {
            for tag in &machine.alarm_tags {
                let ctx = episode_context(&job, &machine, tag);
                let Some(samples) = self.read_samples(&ctx, start, end).await else {
                    summary.skipped_tags += 1;
                    unread_alarm_tags.push(tag.id);
                    continue;
                };
                let segmented = alarm_episodes(&ctx, &samples);
                summary.suppressed += segmented.suppressed;
                alarms.extend(segmented.episodes);
            }

            if let Some(tag) = &machine.state_tag {
                let ctx = episode_context(&job, &machine, tag);
                match self.read_samples(&ctx, start, end).await {
                    Some(samples) => states.extend(state_episodes(&ctx, &samples)),
                    None => {
                        summary.skipped_tags += 1;
                        unread_state_tags.push(tag.id);
                    }
                }
            }
        }

        summary.annotations_restored = snapshot.restore(&mut alarms);

        let before = alarms.len();
        alarms.retain(|episode| !LONG_ALARM_CARVE_OUT.drops(episode));
        summary.carved_out = before - alarms.len();
        if summary.carved_out > 0 {
            tracing::info!(
                job_id,
                removed = summary.carved_out,
                "dropped long alarms from carve-out tag"
            );
        }

        if !unread_alarm_tags.is_empty() || !unread_state_tags.is_empty() {
            let (kept_alarms, kept_states) = self
                .episodes
                .stored_tag_episodes(job_id, &unread_alarm_tags, &unread_state_tags)
                .await?;
            summary.carried_forward = kept_alarms.len() + kept_states.len();
            tracing::info!(
                job_id,
                tags = unread_alarm_tags.len() + unread_state_tags.len(),
                episodes = summary.carried_forward,
                "kept stored episodes for unreadable tags"
            );
            alarms.extend(kept_alarms);
            states.extend(kept_states);
        }

        self.episodes
            .replace_job_episodes(job_id, &alarms, &states)
            .await?;
        summary.alarm_episodes = alarms.len();
        summary.state_episodes = states.len();

        tracing::info!(
            job_id,
            alarm_episodes = summary.alarm_episodes,
            state_episodes = summary.state_episodes,
            annotations_restored = summary.annotations_restored,
            suppressed = summary.suppressed,
            "job episodes rebuilt"
        );

        self.recalculate_efficiency(job_id).await?;
        Ok(summary)
    }

    async fn read_samples(
        &self,
        ctx: &EpisodeContext,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<Vec<TagSample>> {
        match self.samples.samples(ctx.tag_id, start, end).await {
            Ok(samples) => Some(samples),
            Err(err) => {
                tracing::warn!(
                    job_id = ctx.job_id,
                    machine_id = ctx.machine_id,
                    tag_id = ctx.tag_id,
                    error = %err,
                    "failed to read tag samples; skipping tag"
                );
                None
            }
        }
    }

    async fn recalculate_efficiency(&self, job_id: i64) -> Result<(), AggregationError> {
        let Some(efficiency) = &self.efficiency else {
            return Ok(());
        };
        match efficiency.recalculate(job_id).await {
            Ok(()) => Ok(()),
            Err(EfficiencyError::JobMissing(missing)) => {
                Err(AggregationError::JobNotFound(missing))
            }
            Err(EfficiencyError::Failed(err)) => {
                tracing::warn!(job_id, error = %err, "efficiency recalculation failed");
                Ok(())
            }
        }
    }
}

/// Queue payload; `job_id: None` runs a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecalculatePayload {
    #[serde(default)]
    pub job_id: Option<i64>,
}

#[async_trait]
impl JobHandler for AggregationService {
    async fn handle(&self, job: &ScheduledJob) -> Result<JsonValue> {
        let payload: RecalculatePayload = serde_json::from_value(job.payload.clone())?;
        let report = self.recalculate(payload.job_id).await?;
        Ok(serde_json::to_value(report)?)
    }
}

fn episode_context(job: &ProductionJob, machine: &MachineTags, tag: &TagRef) -> EpisodeContext {
    EpisodeContext {
        job_id: job.id,
        machine_id: machine.machine_id,
        machine_name: machine.machine_name.clone(),
        tag_id: tag.id,
        tag_name: tag.name.clone(),
        line_id: job.line_id,
        line_name: job.line_name.clone(),
    }
}
