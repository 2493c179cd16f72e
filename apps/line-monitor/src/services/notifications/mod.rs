use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::services::jobs::{JobHandle, JobScheduler};
use crate::time;

mod dispatch;
mod duration_gate;
mod escalation;
mod eval;
mod store;
mod types;

pub use dispatch::{DispatchSettings, Dispatcher, TriggerContext};
pub use duration_gate::{DurationCheckPayload, DurationGate, GateOutcome, GateTransition, SkipReason};
pub use escalation::{EscalationOutcome, EscalationPayload, EscalationService, StopReason};
pub use eval::{compare, evaluate, parse_numeric, CompareOp};
pub use store::PgNotificationRepository;
pub use types::{
    AckResult, ConditionType, NewNotification, Notification, NotificationEvent, Recipient,
    RecipientSelector, TagValueChange,
};

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn active_rules_for_tag(&self, tag_id: i64) -> Result<Vec<NotificationEvent>>;
    async fn get_rule(&self, event_id: i64) -> Result<Option<NotificationEvent>>;
    /// `None` when the tag no longer exists or has never reported.
    async fn current_tag_value(&self, tag_id: i64) -> Result<Option<String>>;
    async fn mark_triggered(&self, event_id: i64, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Inserts the whole batch or nothing; returns rows in batch order.
    async fn create_notifications(&self, batch: &[NewNotification]) -> Result<Vec<Notification>>;
    async fn get_notification(&self, id: i64) -> Result<Option<Notification>>;
    /// The escalated copy of `parent_id` at `level`, if one was created.
    async fn find_escalation(&self, parent_id: i64, level: i32) -> Result<Option<Notification>>;
    async fn set_escalation_job(&self, id: i64, handle: Option<&JobHandle>) -> Result<()>;
    async fn acknowledge_by_token(&self, token: &str, now: DateTime<Utc>) -> Result<AckResult>;
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn resolve(&self, selector: &RecipientSelector) -> Result<Vec<Recipient>>;
    async fn get_user(&self, user_id: i64) -> Result<Option<Recipient>>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<()>;
    async fn publish(&self, channel: &str, payload: &JsonValue) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeReport {
    pub rules_evaluated: usize,
    pub triggered_events: Vec<i64>,
    pub notifications: usize,
    pub cooldown_skips: usize,
    pub checks_scheduled: usize,
    pub checks_cancelled: usize,
    /// Rules whose evaluation hit a store, directory or scheduler error.
    pub failed_rules: Vec<i64>,
}

/// Entry point for tag changes and acknowledgments.
pub struct NotificationEngine {
    rules: Arc<dyn RuleStore>,
    notifications: Arc<dyn NotificationStore>,
    dispatcher: Arc<Dispatcher>,
    gate: Arc<DurationGate>,
    escalation: Arc<EscalationService>,
}

impl NotificationEngine {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        notifications: Arc<dyn NotificationStore>,
        directory: Arc<dyn RecipientDirectory>,
        sink: Arc<dyn NotificationSink>,
        scheduler: Arc<dyn JobScheduler>,
        settings: DispatchSettings,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            rules.clone(),
            notifications.clone(),
            directory.clone(),
            sink,
            scheduler.clone(),
            settings,
        ));
        let gate = Arc::new(DurationGate::new(
            rules.clone(),
            scheduler.clone(),
            dispatcher.clone(),
        ));
        let escalation = Arc::new(EscalationService::new(
            rules.clone(),
            notifications.clone(),
            directory,
            scheduler,
            dispatcher.clone(),
        ));
        Self {
            rules,
            notifications,
            dispatcher,
            gate,
            escalation,
        }
    }

    pub fn duration_gate(&self) -> Arc<DurationGate> {
        self.gate.clone()
    }

    pub fn escalation(&self) -> Arc<EscalationService> {
        self.escalation.clone()
    }

    pub async fn on_tag_value_changed(&self, change: &TagValueChange) -> Result<ChangeReport> {
        self.on_tag_value_changed_at(change, Utc::now()).await
    }

    /// `now` is the wall-clock trigger time; the sample timestamp never
    /// feeds cooldown. A failing rule is logged and reported without
    /// stopping the others; only the rule lookup itself is fatal.
    pub async fn on_tag_value_changed_at(
        &self,
        change: &TagValueChange,
        now: DateTime<Utc>,
    ) -> Result<ChangeReport> {
        let mut report = ChangeReport::default();
        let rules = self.rules.active_rules_for_tag(change.tag_id).await?;

        for rule in rules {
            report.rules_evaluated += 1;
            if let Err(err) = self.apply_rule(&rule, change, now, &mut report).await {
                tracing::warn!(
                    event_id = rule.id,
                    tag_id = change.tag_id,
                    error = %err,
                    "rule evaluation failed"
                );
                report.failed_rules.push(rule.id);
            }
        }
        Ok(report)
    }

    async fn apply_rule(
        &self,
        rule: &NotificationEvent,
        change: &TagValueChange,
        now: DateTime<Utc>,
        report: &mut ChangeReport,
    ) -> Result<()> {
        if rule.requires_duration_gate() {
            match self.gate.on_change(rule, change, now).await? {
                GateTransition::Scheduled(_) => report.checks_scheduled += 1,
                GateTransition::Cancelled(count) => report.checks_cancelled += count,
                GateTransition::Unchanged => {}
            }
            return Ok(());
        }

        if !evaluate(rule, change) {
            return Ok(());
        }
        if !time::cooldown_expired(rule.last_triggered_at, rule.cooldown_minutes, now) {
            tracing::debug!(event_id = rule.id, tag_id = change.tag_id, "rule in cooldown");
            report.cooldown_skips += 1;
            return Ok(());
        }

        let ctx = TriggerContext {
            tag_value: eval::normalize(change.new_value.as_deref()).to_string(),
            old_value: change.old_value.clone(),
        };
        let created = self.dispatcher.trigger(rule, &ctx, now).await?;
        report.triggered_events.push(rule.id);
        report.notifications += created.len();
        Ok(())
    }

    /// Returns whether a pending escalation check was cancelled.
    pub async fn on_notification_acknowledged(&self, notification_id: i64) -> Result<bool> {
        let Some(notification) = self.notifications.get_notification(notification_id).await?
        else {
            tracing::info!(notification_id, "acknowledged notification not found");
            return Ok(false);
        };
        self.escalation.cancel_for(&notification).await
    }

    pub async fn acknowledge_by_token(&self, token: &str) -> Result<AckResult> {
        self.acknowledge_by_token_at(token, Utc::now()).await
    }

    pub async fn acknowledge_by_token_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AckResult> {
        let result = self.notifications.acknowledge_by_token(token, now).await?;
        if let AckResult::Acknowledged(notification) = &result {
            self.escalation.cancel_for(notification).await?;
        }
        tracing::info!(result = result.as_str(), "acknowledgment token used");
        Ok(result)
    }
}
