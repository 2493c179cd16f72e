use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;

use super::{EpisodeStore, JobDirectory, MachineTags, ProductionJob, SampleReader, TagRef};
use crate::services::episodes::{AlarmEpisode, EpisodeKind, MachineStateEpisode, TagSample};

/// Postgres has a 65535 bind-parameter ceiling; 15 columns per alarm row.
const INSERT_CHUNK: usize = 1_000;

#[derive(Debug, Clone)]
pub struct PgEpisodeRepository {
    pool: PgPool,
}

impl PgEpisodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, FromRow)]
struct JobRow {
    id: i64,
    line_id: i64,
    line_name: String,
    actual_start_time: Option<DateTime<Utc>>,
    actual_end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
struct MachineTagRow {
    machine_id: i64,
    machine_name: String,
    tag_id: i64,
    tag_name: String,
    tag_kind: String,
}

#[async_trait]
impl SampleReader for PgEpisodeRepository {
    async fn samples(
        &self,
        tag_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TagSample>> {
        let rows: Vec<TagSample> = sqlx::query_as(
            r#"
            SELECT tag_id, value, "timestamp"
            FROM tag_values
            WHERE tag_id = $1
              AND "timestamp" >= $2
              AND "timestamp" <= $3
            ORDER BY "timestamp" ASC, id ASC
            "#,
        )
        .bind(tag_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to read samples for tag {tag_id}"))?;
        Ok(rows)
    }
}

#[async_trait]
impl JobDirectory for PgEpisodeRepository {
    async fn get_job(&self, job_id: i64) -> Result<Option<ProductionJob>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT j.id, j.line_id, l.name AS line_name, j.actual_start_time, j.actual_end_time
            FROM jobs j
            JOIN lines l ON l.id = j.line_id
            WHERE j.id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ProductionJob {
            id: row.id,
            line_id: row.line_id,
            line_name: row.line_name,
            actual_start_time: row.actual_start_time,
            actual_end_time: row.actual_end_time,
        }))
    }

    async fn line_machines(&self, line_id: i64) -> Result<Vec<MachineTags>> {
        let rows: Vec<MachineTagRow> = sqlx::query_as(
            r#"
            SELECT
                m.id AS machine_id,
                m.name AS machine_name,
                t.id AS tag_id,
                t.name AS tag_name,
                t.tag_kind
            FROM machines m
            JOIN tags t ON t.machine_id = m.id
            WHERE m.line_id = $1
              AND t.tag_kind IN ('alarm', 'state')
            ORDER BY m.id ASC, t.id ASC
            "#,
        )
        .bind(line_id)
        .fetch_all(&self.pool)
        .await?;

        let mut machines: BTreeMap<i64, MachineTags> = BTreeMap::new();
        for row in rows {
            let machine = machines
                .entry(row.machine_id)
                .or_insert_with(|| MachineTags {
                    machine_id: row.machine_id,
                    machine_name: row.machine_name.clone(),
                    alarm_tags: Vec::new(),
                    state_tag: None,
                });
            let tag = TagRef {
                id: row.tag_id,
                name: row.tag_name,
            };
            match row.tag_kind.as_str() {
                "alarm" => machine.alarm_tags.push(tag),
                "state" => {
                    if let Some(existing) = &machine.state_tag {
                        tracing::warn!(
                            machine_id = row.machine_id,
                            kept_tag_id = existing.id,
                            ignored_tag_id = tag.id,
                            "machine has more than one state tag"
                        );
                    } else {
                        machine.state_tag = Some(tag);
                    }
                }
                _ => {}
            }
        }
        Ok(machines.into_values().collect())
    }

    async fn jobs_needing_aggregation(&self, kind: EpisodeKind) -> Result<Vec<i64>> {
        let sql = match kind {
            EpisodeKind::Alarm => {
                r#"
                SELECT j.id
                FROM jobs j
                WHERE j.actual_start_time IS NOT NULL
                  AND j.actual_end_time IS NOT NULL
                  AND NOT EXISTS (SELECT 1 FROM alarm_episodes a WHERE a.job_id = j.id)
                ORDER BY j.id ASC
                "#
            }
            EpisodeKind::State => {
                r#"
                SELECT j.id
                FROM jobs j
                WHERE j.actual_start_time IS NOT NULL
                  AND j.actual_end_time IS NOT NULL
                  AND NOT EXISTS (SELECT 1 FROM machine_state_episodes s WHERE s.job_id = j.id)
                ORDER BY j.id ASC
                "#
            }
        };
        let rows: Vec<(i64,)> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }
}

#[async_trait]
impl EpisodeStore for PgEpisodeRepository {
    async fn annotated_alarm_episodes(&self, job_id: i64) -> Result<Vec<AlarmEpisode>> {
        let rows: Vec<AlarmEpisode> = sqlx::query_as(
            r#"
            SELECT
                job_id, machine_id, machine_name, tag_id, tag_name, line_id, line_name,
                alarm_code, start_time, end_time, duration_minutes,
                reason_id, reason_name, note, processed
            FROM alarm_episodes
            WHERE job_id = $1
              AND (reason_id IS NOT NULL OR note IS NOT NULL)
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn stored_tag_episodes(
        &self,
        job_id: i64,
        alarm_tags: &[i64],
        state_tags: &[i64],
    ) -> Result<(Vec<AlarmEpisode>, Vec<MachineStateEpisode>)> {
        let alarms: Vec<AlarmEpisode> = if alarm_tags.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as(
                r#"
                SELECT
                    job_id, machine_id, machine_name, tag_id, tag_name, line_id, line_name,
                    alarm_code, start_time, end_time, duration_minutes,
                    reason_id, reason_name, note, processed
                FROM alarm_episodes
                WHERE job_id = $1 AND tag_id = ANY($2)
                ORDER BY start_time
                "#,
            )
            .bind(job_id)
            .bind(alarm_tags)
            .fetch_all(&self.pool)
            .await
            .context("failed to load stored alarm episodes")?
        };
        let states: Vec<MachineStateEpisode> = if state_tags.is_empty() {
            Vec::new()
        } else {
            sqlx::query_as(
                r#"
                SELECT
                    job_id, machine_id, machine_name, tag_id, tag_name, line_id, line_name,
                    state_code, state_name, start_time, end_time, duration_minutes,
                    user_note, processed
                FROM machine_state_episodes
                WHERE job_id = $1 AND tag_id = ANY($2)
                ORDER BY start_time
                "#,
            )
            .bind(job_id)
            .bind(state_tags)
            .fetch_all(&self.pool)
            .await
            .context("failed to load stored state episodes")?
        };
        Ok((alarms, states))
    }

    async fn replace_job_episodes(
        &self,
        job_id: i64,
        alarms: &[AlarmEpisode],
        states: &[MachineStateEpisode],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM alarm_episodes WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM machine_state_episodes WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        for chunk in alarms.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO alarm_episodes (job_id, machine_id, machine_name, tag_id, tag_name, \
                 line_id, line_name, alarm_code, start_time, end_time, duration_minutes, \
                 reason_id, reason_name, note, processed) ",
            );
            qb.push_values(chunk, |mut row, episode| {
                row.push_bind(episode.job_id)
                    .push_bind(episode.machine_id)
                    .push_bind(&episode.machine_name)
                    .push_bind(episode.tag_id)
                    .push_bind(&episode.tag_name)
                    .push_bind(episode.line_id)
                    .push_bind(&episode.line_name)
                    .push_bind(&episode.alarm_code)
                    .push_bind(episode.start_time)
                    .push_bind(episode.end_time)
                    .push_bind(episode.duration_minutes)
                    .push_bind(episode.reason_id)
                    .push_bind(&episode.reason_name)
                    .push_bind(&episode.note)
                    .push_bind(episode.processed);
            });
            qb.build().execute(&mut *tx).await?;
        }

        for chunk in states.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO machine_state_episodes (job_id, machine_id, machine_name, tag_id, \
                 tag_name, line_id, line_name, state_code, state_name, start_time, end_time, \
                 duration_minutes, user_note, processed) ",
            );
            qb.push_values(chunk, |mut row, episode| {
                row.push_bind(episode.job_id)
                    .push_bind(episode.machine_id)
                    .push_bind(&episode.machine_name)
                    .push_bind(episode.tag_id)
                    .push_bind(&episode.tag_name)
                    .push_bind(episode.line_id)
                    .push_bind(&episode.line_name)
                    .push_bind(episode.state_code)
                    .push_bind(&episode.state_name)
                    .push_bind(episode.start_time)
                    .push_bind(episode.end_time)
                    .push_bind(episode.duration_minutes)
                    .push_bind(&episode.user_note)
                    .push_bind(episode.processed);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
