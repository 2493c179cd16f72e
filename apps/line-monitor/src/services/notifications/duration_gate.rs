use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use super::dispatch::{Dispatcher, TriggerContext};
use super::eval::normalize;
use super::types::{NotificationEvent, TagValueChange};
use super::RuleStore;
use crate::services::jobs::{JobHandle, JobHandler, JobQueue, JobScheduler, ScheduledJob};
use crate::time;

/// Pending-state marker for a (rule, tag) pair; the scheduled job is the
/// only record that a wait is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationCheckPayload {
    pub event_id: i64,
    pub tag_id: i64,
    pub target_state: String,
    pub previous_value: Option<String>,
    pub entered_at: DateTime<Utc>,
    pub duration: i64,
    pub duration_unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateTransition {
    Scheduled(JobHandle),
    Cancelled(usize),
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EventNotFound,
    EventInactive,
    TagNotFound,
    StateChanged,
    DurationNotElapsed,
    CooldownActive,
    AlreadyTriggered,
    InvalidConfig,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EventNotFound => "event_not_found",
            Self::EventInactive => "event_inactive",
            Self::TagNotFound => "tag_not_found",
            Self::StateChanged => "state_changed",
            Self::DurationNotElapsed => "duration_not_elapsed",
            Self::CooldownActive => "cooldown_active",
            Self::AlreadyTriggered => "already_triggered",
            Self::InvalidConfig => "invalid_config",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GateOutcome {
    Triggered { notifications: usize },
    Skipped { reason: SkipReason },
}

pub struct DurationGate {
    rules: Arc<dyn RuleStore>,
    scheduler: Arc<dyn JobScheduler>,
    dispatcher: Arc<Dispatcher>,
}

impl DurationGate {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        scheduler: Arc<dyn JobScheduler>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            rules,
            scheduler,
            dispatcher,
        }
    }

    /// Schedules a check when the tag enters the rule's target state and
    /// cancels pending checks when it leaves.
    pub async fn on_change(
        &self,
        rule: &NotificationEvent,
        change: &TagValueChange,
        now: DateTime<Utc>,
    ) -> Result<GateTransition> {
        let Some(target) = rule.target_state.as_deref().map(|value| normalize(Some(value)))
        else {
            tracing::warn!(event_id = rule.id, "state rule has no target state");
            return Ok(GateTransition::Unchanged);
        };
        let new_value = normalize(change.new_value.as_deref());
        let old_value = normalize(change.old_value.as_deref());

        if new_value == target && old_value != target {
            let (Some(duration), Some(unit)) =
                (rule.state_duration, rule.state_duration_unit.as_deref())
            else {
                tracing::warn!(event_id = rule.id, "state rule missing duration unit");
                return Ok(GateTransition::Unchanged);
            };
            let required = match time::parse_duration(duration, unit) {
                Ok(required) => required,
                Err(err) => {
                    tracing::warn!(event_id = rule.id, error = %err, "invalid state duration");
                    return Ok(GateTransition::Unchanged);
                }
            };
            let payload = serde_json::to_value(DurationCheckPayload {
                event_id: rule.id,
                tag_id: change.tag_id,
                target_state: target.to_string(),
                previous_value: change.old_value.clone(),
                entered_at: now,
                duration,
                duration_unit: unit.to_string(),
            })?;
            let handle = self
                .scheduler
                .schedule(JobQueue::StateDurationCheck, payload, time::to_std(required))
                .await?;
            tracing::info!(
                event_id = rule.id,
                tag_id = change.tag_id,
                job_id = %handle,
                "state duration check scheduled"
            );
            return Ok(GateTransition::Scheduled(handle));
        }

        if old_value == target && new_value != target {
            let cancelled = self.cancel_pending(rule.id, change.tag_id).await?;
            if cancelled > 0 {
                tracing::info!(
                    event_id = rule.id,
                    tag_id = change.tag_id,
                    cancelled,
                    "state left target; duration checks cancelled"
                );
            }
            return Ok(GateTransition::Cancelled(cancelled));
        }

        Ok(GateTransition::Unchanged)
    }

    /// Re-verifies a matured check against current state and fires the rule
    /// when everything still holds.
    pub async fn execute(
        &self,
        payload: &DurationCheckPayload,
        now: DateTime<Utc>,
    ) -> Result<GateOutcome> {
        let skipped = |reason: SkipReason| -> Result<GateOutcome> {
            tracing::info!(
                event_id = payload.event_id,
                tag_id = payload.tag_id,
                reason = reason.as_str(),
                "state duration check skipped"
            );
            Ok(GateOutcome::Skipped { reason })
        };

        let Some(rule) = self.rules.get_rule(payload.event_id).await? else {
            return skipped(SkipReason::EventNotFound);
        };
        if !rule.is_active {
            return skipped(SkipReason::EventInactive);
        }
        let Some(current) = self.rules.current_tag_value(payload.tag_id).await? else {
            return skipped(SkipReason::TagNotFound);
        };
        if normalize(Some(&current)) != normalize(Some(&payload.target_state)) {
            return skipped(SkipReason::StateChanged);
        }
        let Ok(required) = time::parse_duration(payload.duration, &payload.duration_unit) else {
            return skipped(SkipReason::InvalidConfig);
        };
        if !time::has_elapsed(payload.entered_at, required, now) {
            return skipped(SkipReason::DurationNotElapsed);
        }
        // The rule already fired for this stay in the target state.
        let matured_at = payload.entered_at.checked_add_signed(required);
        if matches!(
            (rule.last_triggered_at, matured_at),
            (Some(fired), Some(matured)) if fired >= matured
        ) {
            return skipped(SkipReason::AlreadyTriggered);
        }
        if !time::cooldown_expired(rule.last_triggered_at, rule.cooldown_minutes, now) {
            return skipped(SkipReason::CooldownActive);
        }

        let ctx = TriggerContext {
            tag_value: current,
            old_value: payload.previous_value.clone(),
        };
        let created = self.dispatcher.trigger(&rule, &ctx, now).await?;
        Ok(GateOutcome::Triggered {
            notifications: created.len(),
        })
    }

    async fn cancel_pending(&self, event_id: i64, tag_id: i64) -> Result<usize> {
        let mut cancelled = 0usize;
        for job in self.scheduler.pending(JobQueue::StateDurationCheck).await? {
            let Ok(payload) = serde_json::from_value::<DurationCheckPayload>(job.payload.clone())
            else {
                continue;
            };
            if payload.event_id != event_id || payload.tag_id != tag_id {
                continue;
            }
            if self.scheduler.cancel(&job.handle).await? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

#[async_trait]
impl JobHandler for DurationGate {
    async fn handle(&self, job: &ScheduledJob) -> Result<JsonValue> {
        let payload: DurationCheckPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "malformed state duration payload");
                return Ok(serde_json::json!({"result": "skipped", "reason": "invalid_payload"}));
            }
        };
        let outcome = self.execute(&payload, Utc::now()).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}
