use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

use super::escalation::EscalationPayload;
use super::types::{NewNotification, Notification, NotificationEvent, Recipient};
use super::{NotificationSink, NotificationStore, RecipientDirectory, RuleStore};
use crate::services::jobs::{JobHandle, JobQueue, JobScheduler};
use crate::time;

const DEFAULT_TEMPLATE: &str = "{event_name}: value changed from {old_value} to {tag_value}";

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub token_ttl: Duration,
    pub ack_base_url: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            token_ttl: Duration::hours(72),
            ack_base_url: None,
        }
    }
}

/// Values substituted into a rule's message template.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerContext {
    pub tag_value: String,
    pub old_value: Option<String>,
}

/// Creates, delivers, and schedules escalation for notifications.
pub struct Dispatcher {
    rules: Arc<dyn RuleStore>,
    notifications: Arc<dyn NotificationStore>,
    directory: Arc<dyn RecipientDirectory>,
    sink: Arc<dyn NotificationSink>,
    scheduler: Arc<dyn JobScheduler>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        notifications: Arc<dyn NotificationStore>,
        directory: Arc<dyn RecipientDirectory>,
        sink: Arc<dyn NotificationSink>,
        scheduler: Arc<dyn JobScheduler>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            rules,
            notifications,
            directory,
            sink,
            scheduler,
            settings,
        }
    }

    /// Fires a rule: one level-0 notification per resolved recipient.
    pub async fn trigger(
        &self,
        rule: &NotificationEvent,
        ctx: &TriggerContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let recipients = self.directory.resolve(&rule.recipients).await?;
        if recipients.is_empty() {
            tracing::warn!(event_id = rule.id, "rule resolved to no recipients");
        }

        let message = render_message(rule, ctx);
        let batch: Vec<NewNotification> = recipients
            .iter()
            .map(|recipient| {
                let (token, expires) = self.new_token(now);
                NewNotification {
                    event_id: rule.id,
                    user_id: recipient.id,
                    message: message.clone(),
                    tag_value: ctx.tag_value.clone(),
                    old_tag_value: ctx.old_value.clone(),
                    escalation_level: 0,
                    parent_notification_id: None,
                    email_token: Some(token),
                    token_expires_at: Some(expires),
                }
            })
            .collect();

        let created = if batch.is_empty() {
            Vec::new()
        } else {
            self.notifications.create_notifications(&batch).await?
        };
        self.rules.mark_triggered(rule.id, now).await?;

        let by_user: HashMap<i64, &Recipient> =
            recipients.iter().map(|recipient| (recipient.id, recipient)).collect();
        let subject = email_subject(rule, 0);
        for notification in &created {
            if let Some(recipient) = by_user.get(&notification.user_id) {
                self.deliver(rule, notification, recipient, &subject).await;
            }
            if rule.escalation_enabled() {
                self.start_escalation(rule, notification).await;
            }
        }

        tracing::info!(
            event_id = rule.id,
            event_name = %rule.name,
            notifications = created.len(),
            "notification rule triggered"
        );
        Ok(created)
    }

    /// Sends one notification. Failures are logged, never returned.
    pub async fn deliver(
        &self,
        rule: &NotificationEvent,
        notification: &Notification,
        recipient: &Recipient,
        subject: &str,
    ) {
        if rule.send_email {
            match recipient
                .email
                .as_deref()
                .map(str::trim)
                .filter(|email| !email.is_empty())
            {
                Some(address) => {
                    let html = email_html(
                        &notification.message,
                        self.ack_url(notification.email_token.as_deref()).as_deref(),
                    );
                    if let Err(err) = self.sink.send_email(address, subject, &html).await {
                        tracing::warn!(
                            notification_id = notification.id,
                            user_id = recipient.id,
                            error = %err,
                            "notification email failed"
                        );
                    }
                }
                None => {
                    tracing::warn!(
                        notification_id = notification.id,
                        user_id = recipient.id,
                        "recipient has no email address"
                    );
                }
            }
        }

        if rule.send_in_app {
            let channel = format!("notifications/{}", recipient.id);
            let payload = match serde_json::to_value(notification) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(notification_id = notification.id, error = %err, "failed to encode notification");
                    return;
                }
            };
            if let Err(err) = self.sink.publish(&channel, &payload).await {
                tracing::warn!(
                    notification_id = notification.id,
                    channel = %channel,
                    error = %err,
                    "live notification push failed"
                );
            }
        }
    }

    /// Schedules the check that escalates past `current_level`. `None` when
    /// the rule's escalation delay is unusable.
    pub async fn schedule_escalation(
        &self,
        rule: &NotificationEvent,
        notification_id: i64,
        current_level: i32,
    ) -> Result<Option<JobHandle>> {
        let (Some(amount), Some(unit)) = (rule.escalation_delay, rule.escalation_delay_unit.as_deref())
        else {
            tracing::warn!(event_id = rule.id, "escalation enabled without a delay");
            return Ok(None);
        };
        let delay = match time::parse_duration(amount, unit) {
            Ok(delay) => delay,
            Err(err) => {
                tracing::warn!(event_id = rule.id, error = %err, "invalid escalation delay");
                return Ok(None);
            }
        };
        let payload = serde_json::to_value(EscalationPayload {
            notification_id,
            event_id: rule.id,
            current_level,
        })?;
        let handle = self
            .scheduler
            .schedule(JobQueue::EscalationCheck, payload, time::to_std(delay))
            .await?;
        Ok(Some(handle))
    }

    pub fn new_token(&self, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        (generate_token(), now + self.settings.token_ttl)
    }

    async fn start_escalation(&self, rule: &NotificationEvent, notification: &Notification) {
        let result = async {
            if let Some(handle) = self.schedule_escalation(rule, notification.id, 0).await? {
                self.notifications
                    .set_escalation_job(notification.id, Some(&handle))
                    .await?;
            }
            anyhow::Ok(())
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(
                notification_id = notification.id,
                event_id = rule.id,
                error = %err,
                "failed to schedule escalation"
            );
        }
    }

    fn ack_url(&self, token: Option<&str>) -> Option<String> {
        let base = self.settings.ack_base_url.as_deref()?;
        let token = token?;
        Some(format!(
            "{}/notifications/acknowledge/{token}",
            base.trim_end_matches('/')
        ))
    }
}

pub fn render_message(rule: &NotificationEvent, ctx: &TriggerContext) -> String {
    let template = rule
        .message_template
        .as_deref()
        .map(str::trim)
        .filter(|template| !template.is_empty())
        .unwrap_or(DEFAULT_TEMPLATE);
    fill_placeholders(template, |name| match name {
        "tag_value" => Some(ctx.tag_value.as_str()),
        "old_value" => Some(ctx.old_value.as_deref().unwrap_or("")),
        "event_name" => Some(rule.name.as_str()),
        _ => None,
    })
}

/// Substitutes `{name}` placeholders in one pass; substituted text is never
/// rescanned and unknown placeholders stay literal.
fn fill_placeholders<'a>(template: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open..];
        let value = candidate
            .find('}')
            .and_then(|close| lookup(&candidate[1..close]).map(|value| (value, close)));
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &candidate[close + 1..];
            }
            None => {
                out.push('{');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn email_subject(rule: &NotificationEvent, level: i32) -> String {
    if level == 0 {
        format!("Alert: {}", rule.name)
    } else {
        format!("Escalation level {level}: {}", rule.name)
    }
}

fn email_html(message: &str, ack_url: Option<&str>) -> String {
    let mut html = format!("<p>{}</p>", escape_html(message));
    if let Some(url) = ack_url {
        html.push_str(&format!(
            "<p><a href=\"{}\">Acknowledge</a></p>",
            escape_html(url)
        ));
    }
    html
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn generate_token() -> String {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notifications::types::ConditionType;
    use crate::test_support::notification_rule;

    #[test]
    fn renders_placeholders_and_falls_back_to_default_template() {
        let mut rule = notification_rule(1, ConditionType::ValueChange);
        rule.name = "Filler speed".to_string();
        let ctx = TriggerContext {
            tag_value: "120".to_string(),
            old_value: Some("80".to_string()),
        };
        assert_eq!(
            render_message(&rule, &ctx),
            "Filler speed: value changed from 80 to 120"
        );

        rule.message_template = Some("{event_name} now {tag_value} (was {old_value})".to_string());
        let ctx = TriggerContext {
            tag_value: "3".to_string(),
            old_value: None,
        };
        assert_eq!(render_message(&rule, &ctx), "Filler speed now 3 (was )");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let mut rule = notification_rule(1, ConditionType::ValueChange);
        rule.name = "Labeler {tag_value}".to_string();
        rule.message_template = Some("{event_name} reads {tag_value} {unknown} {".to_string());
        let ctx = TriggerContext {
            tag_value: "{event_name}".to_string(),
            old_value: Some("{old_value}".to_string()),
        };
        assert_eq!(
            render_message(&rule, &ctx),
            "Labeler {tag_value} reads {event_name} {unknown} {"
        );

        rule.message_template = Some("{old_value}->{tag_value}".to_string());
        assert_eq!(render_message(&rule, &ctx), "{old_value}->{event_name}");
    }

    #[test]
    fn email_body_is_escaped() {
        let html = email_html("<b>jam</b> & stop", Some("https://x/ack?a=1&b=2"));
        assert_eq!(
            html,
            "<p>&lt;b&gt;jam&lt;/b&gt; &amp; stop</p><p><a href=\"https://x/ack?a=1&amp;b=2\">Acknowledge</a></p>"
        );
    }

    #[test]
    fn tokens_are_url_safe_and_unique() {
        let first = generate_token();
        let second = generate_token();
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert!(first
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
    }
}
