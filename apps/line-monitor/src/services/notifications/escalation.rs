use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use super::dispatch::{email_subject, Dispatcher};
use super::types::{NewNotification, Notification, NotificationEvent};
use super::{NotificationStore, RecipientDirectory, RuleStore};
use crate::services::jobs::{JobHandle, JobHandler, JobScheduler, ScheduledJob};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPayload {
    /// Always the level-0 notification.
    pub notification_id: i64,
    pub event_id: i64,
    pub current_level: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NotificationNotFound,
    Acknowledged,
    EventNotFound,
    EscalationDisabled,
    MaxLevelReached,
    RecipientNotFound,
    InvalidLevel,
    AlreadyEscalated,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotificationNotFound => "notification_not_found",
            Self::Acknowledged => "acknowledged",
            Self::EventNotFound => "event_not_found",
            Self::EscalationDisabled => "escalation_disabled",
            Self::MaxLevelReached => "max_level_reached",
            Self::RecipientNotFound => "recipient_not_found",
            Self::InvalidLevel => "invalid_level",
            Self::AlreadyEscalated => "already_escalated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EscalationOutcome {
    Escalated {
        notification_id: i64,
        level: i32,
        next_job: Option<JobHandle>,
    },
    Stopped {
        reason: StopReason,
    },
}

pub struct EscalationService {
    rules: Arc<dyn RuleStore>,
    notifications: Arc<dyn NotificationStore>,
    directory: Arc<dyn RecipientDirectory>,
    scheduler: Arc<dyn JobScheduler>,
    dispatcher: Arc<Dispatcher>,
}

impl EscalationService {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        notifications: Arc<dyn NotificationStore>,
        directory: Arc<dyn RecipientDirectory>,
        scheduler: Arc<dyn JobScheduler>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            rules,
            notifications,
            directory,
            scheduler,
            dispatcher,
        }
    }

    /// Starts the chain for a level-0 notification created outside the
    /// regular trigger path.
    pub async fn schedule_initial(&self, notification: &Notification) -> Result<Option<JobHandle>> {
        if notification.escalation_level != 0 {
            return Ok(None);
        }
        let Some(rule) = self.rules.get_rule(notification.event_id).await? else {
            return Ok(None);
        };
        if !rule.escalation_enabled() {
            return Ok(None);
        }
        let handle = self
            .dispatcher
            .schedule_escalation(&rule, notification.id, 0)
            .await?;
        if let Some(handle) = &handle {
            self.notifications
                .set_escalation_job(notification.id, Some(handle))
                .await?;
        }
        Ok(handle)
    }

    pub async fn execute(
        &self,
        payload: &EscalationPayload,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome> {
        let stopped = |reason: StopReason| -> Result<EscalationOutcome> {
            tracing::info!(
                notification_id = payload.notification_id,
                event_id = payload.event_id,
                level = payload.current_level,
                reason = reason.as_str(),
                "escalation chain stopped"
            );
            Ok(EscalationOutcome::Stopped { reason })
        };

        let Some(original) = self
            .notifications
            .get_notification(payload.notification_id)
            .await?
        else {
            return stopped(StopReason::NotificationNotFound);
        };
        if original.acknowledged_at.is_some() {
            return stopped(StopReason::Acknowledged);
        }
        let Some(rule) = self.rules.get_rule(payload.event_id).await? else {
            return stopped(StopReason::EventNotFound);
        };
        if !rule.escalation_enabled() {
            return stopped(StopReason::EscalationDisabled);
        }

        if payload.current_level < 0 {
            return stopped(StopReason::InvalidLevel);
        }
        let Some(next_level) = payload.current_level.checked_add(1) else {
            return stopped(StopReason::MaxLevelReached);
        };
        let chain_len = i32::try_from(rule.escalation_user_ids.len()).unwrap_or(i32::MAX);
        if next_level > rule.max_escalation_level || next_level > chain_len {
            return stopped(StopReason::MaxLevelReached);
        }
        let has_next = next_level < rule.max_escalation_level && next_level < chain_len;

        // A redelivered check finds the copy from its earlier run.
        if let Some(existing) = self
            .notifications
            .find_escalation(original.id, next_level)
            .await?
        {
            if existing.escalation_job_id.is_some() || !has_next {
                return stopped(StopReason::AlreadyEscalated);
            }
            let next_job = self.schedule_next(&rule, &original, &existing, next_level).await?;
            tracing::info!(
                notification_id = original.id,
                escalated_id = existing.id,
                level = next_level,
                "escalation resumed from existing copy"
            );
            return Ok(EscalationOutcome::Escalated {
                notification_id: existing.id,
                level: next_level,
                next_job,
            });
        }

        let Some(user_id) = usize::try_from(next_level - 1)
            .ok()
            .and_then(|index| rule.escalation_user_ids.get(index).copied())
        else {
            return stopped(StopReason::MaxLevelReached);
        };
        let Some(recipient) = self.directory.get_user(user_id).await? else {
            return stopped(StopReason::RecipientNotFound);
        };

        let (token, expires) = self.dispatcher.new_token(now);
        let created = self
            .notifications
            .create_notifications(&[NewNotification {
                event_id: rule.id,
                user_id: recipient.id,
                message: format!("[Escalation level {next_level}] {}", original.message),
                tag_value: original.tag_value.clone(),
                old_tag_value: original.old_tag_value.clone(),
                escalation_level: next_level,
                parent_notification_id: Some(original.id),
                email_token: Some(token),
                token_expires_at: Some(expires),
            }])
            .await?;
        let Some(escalated) = created.into_iter().next() else {
            anyhow::bail!("notification store returned no row for escalation");
        };

        self.dispatcher
            .deliver(&rule, &escalated, &recipient, &email_subject(&rule, next_level))
            .await;

        let next_job = if has_next {
            self.schedule_next(&rule, &original, &escalated, next_level)
                .await?
        } else {
            None
        };

        tracing::info!(
            notification_id = original.id,
            escalated_id = escalated.id,
            level = next_level,
            user_id = recipient.id,
            "notification escalated"
        );
        Ok(EscalationOutcome::Escalated {
            notification_id: escalated.id,
            level: next_level,
            next_job,
        })
    }

    async fn schedule_next(
        &self,
        rule: &NotificationEvent,
        original: &Notification,
        escalated: &Notification,
        level: i32,
    ) -> Result<Option<JobHandle>> {
        let handle = self
            .dispatcher
            .schedule_escalation(rule, original.id, level)
            .await?;
        if let Some(handle) = &handle {
            self.notifications
                .set_escalation_job(escalated.id, Some(handle))
                .await?;
        }
        Ok(handle)
    }

    /// Cancels the pending check stored on a level-0 notification. Escalated
    /// copies never stop the chain.
    pub async fn cancel_for(&self, notification: &Notification) -> Result<bool> {
        if notification.escalation_level != 0 {
            tracing::info!(
                notification_id = notification.id,
                level = notification.escalation_level,
                "escalated copy acknowledged; chain continues"
            );
            return Ok(false);
        }
        let Some(handle) = &notification.escalation_job_id else {
            return Ok(false);
        };
        let cancelled = self.scheduler.cancel(handle).await?;
        self.notifications
            .set_escalation_job(notification.id, None)
            .await?;
        tracing::info!(
            notification_id = notification.id,
            job_id = %handle,
            cancelled,
            "escalation cancelled by acknowledgment"
        );
        Ok(cancelled)
    }
}

#[async_trait]
impl JobHandler for EscalationService {
    async fn handle(&self, job: &ScheduledJob) -> Result<JsonValue> {
        let payload: EscalationPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "malformed escalation payload");
                return Ok(serde_json::json!({"result": "stopped", "reason": "invalid_payload"}));
            }
        };
        let outcome = self.execute(&payload, Utc::now()).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}
