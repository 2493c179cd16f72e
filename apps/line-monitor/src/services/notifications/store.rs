use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use super::types::{
    AckResult, ConditionType, NewNotification, Notification, NotificationEvent, Recipient,
    RecipientSelector,
};
use super::{NotificationStore, RecipientDirectory, RuleStore};
use crate::services::jobs::JobHandle;

const EVENT_COLUMNS: &str = "id, name, tag_id, condition_type, threshold_value, \
    comparison_operator, target_state, state_duration, state_duration_unit, cooldown_minutes, \
    last_triggered_at, is_active, message_template, send_email, send_in_app, recipients, \
    enable_escalation, escalation_delay, escalation_delay_unit, escalation_user_ids, \
    max_escalation_level";

const NOTIFICATION_COLUMNS: &str = "id, event_id, user_id, message, tag_value, old_tag_value, \
    is_read, acknowledged_at, escalation_level, parent_notification_id, escalation_job_id, \
    email_token, token_expires_at, created_at";

#[derive(Debug, Clone)]
pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, FromRow)]
struct EventRow {
    id: i64,
    name: String,
    tag_id: i64,
    condition_type: String,
    threshold_value: Option<f64>,
    comparison_operator: Option<String>,
    target_state: Option<String>,
    state_duration: Option<i64>,
    state_duration_unit: Option<String>,
    cooldown_minutes: i64,
    last_triggered_at: Option<DateTime<Utc>>,
    is_active: bool,
    message_template: Option<String>,
    send_email: bool,
    send_in_app: bool,
    recipients: SqlJson<JsonValue>,
    enable_escalation: bool,
    escalation_delay: Option<i64>,
    escalation_delay_unit: Option<String>,
    escalation_user_ids: Vec<i64>,
    max_escalation_level: i32,
}

impl EventRow {
    /// Rows that cannot be interpreted are configuration errors: logged and
    /// treated as absent.
    fn into_event(self) -> Option<NotificationEvent> {
        let Some(condition_type) = ConditionType::parse(&self.condition_type) else {
            tracing::warn!(
                event_id = self.id,
                condition_type = %self.condition_type,
                "notification rule has unknown condition type"
            );
            return None;
        };
        let recipients: RecipientSelector = match serde_json::from_value(self.recipients.0) {
            Ok(selector) => selector,
            Err(err) => {
                tracing::warn!(event_id = self.id, error = %err, "notification rule has invalid recipients");
                return None;
            }
        };
        Some(NotificationEvent {
            id: self.id,
            name: self.name,
            tag_id: self.tag_id,
            condition_type,
            threshold_value: self.threshold_value,
            comparison_operator: self.comparison_operator,
            target_state: self.target_state,
            state_duration: self.state_duration,
            state_duration_unit: self.state_duration_unit,
            cooldown_minutes: self.cooldown_minutes,
            last_triggered_at: self.last_triggered_at,
            is_active: self.is_active,
            message_template: self.message_template,
            send_email: self.send_email,
            send_in_app: self.send_in_app,
            recipients,
            enable_escalation: self.enable_escalation,
            escalation_delay: self.escalation_delay,
            escalation_delay_unit: self.escalation_delay_unit,
            escalation_user_ids: self.escalation_user_ids,
            max_escalation_level: self.max_escalation_level,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct NotificationRow {
    id: i64,
    event_id: i64,
    user_id: i64,
    message: String,
    tag_value: String,
    old_tag_value: Option<String>,
    is_read: bool,
    acknowledged_at: Option<DateTime<Utc>>,
    escalation_level: i32,
    parent_notification_id: Option<i64>,
    escalation_job_id: Option<String>,
    email_token: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Self {
            id: row.id,
            event_id: row.event_id,
            user_id: row.user_id,
            message: row.message,
            tag_value: row.tag_value,
            old_tag_value: row.old_tag_value,
            is_read: row.is_read,
            acknowledged_at: row.acknowledged_at,
            escalation_level: row.escalation_level,
            parent_notification_id: row.parent_notification_id,
            escalation_job_id: row.escalation_job_id.map(JobHandle),
            email_token: row.email_token,
            token_expires_at: row.token_expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct UserRow {
    id: i64,
    email: Option<String>,
    name: String,
}

impl From<UserRow> for Recipient {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            name: row.name,
        }
    }
}

#[async_trait]
impl RuleStore for PgNotificationRepository {
    async fn active_rules_for_tag(&self, tag_id: i64) -> Result<Vec<NotificationEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM notification_events \
             WHERE tag_id = $1 AND is_active = TRUE ORDER BY id ASC"
        ))
        .bind(tag_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(EventRow::into_event).collect())
    }

    async fn get_rule(&self, event_id: i64) -> Result<Option<NotificationEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM notification_events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(EventRow::into_event))
    }

    async fn current_tag_value(&self, tag_id: i64) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT v.value
            FROM tags t
            JOIN tag_values v ON v.tag_id = t.id
            WHERE t.id = $1
            ORDER BY v."timestamp" DESC, v.id DESC
            LIMIT 1
            "#,
        )
        .bind(tag_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.0))
    }

    async fn mark_triggered(&self, event_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE notification_events SET last_triggered_at = $2 WHERE id = $1")
            .bind(event_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PgNotificationRepository {
    async fn create_notifications(&self, batch: &[NewNotification]) -> Result<Vec<Notification>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO notifications (event_id, user_id, message, tag_value, old_tag_value, \
             escalation_level, parent_notification_id, email_token, token_expires_at) ",
        );
        qb.push_values(batch, |mut row, item| {
            row.push_bind(item.event_id)
                .push_bind(item.user_id)
                .push_bind(&item.message)
                .push_bind(&item.tag_value)
                .push_bind(&item.old_tag_value)
                .push_bind(item.escalation_level)
                .push_bind(item.parent_notification_id)
                .push_bind(&item.email_token)
                .push_bind(item.token_expires_at);
        });
        qb.push(format!(" RETURNING {NOTIFICATION_COLUMNS}"));
        let mut rows: Vec<NotificationRow> = qb.build_query_as().fetch_all(&mut *tx).await?;
        tx.commit().await?;
        // RETURNING order is not guaranteed; ids are assigned in VALUES order.
        rows.sort_by_key(|row| row.id);
        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn get_notification(&self, id: i64) -> Result<Option<Notification>> {
        let row: Option<NotificationRow> = sqlx::query_as(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Notification::from))
    }

    async fn find_escalation(&self, parent_id: i64, level: i32) -> Result<Option<Notification>> {
        let row: Option<NotificationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE parent_notification_id = $1 AND escalation_level = $2
            ORDER BY id
            LIMIT 1
            "#
        ))
        .bind(parent_id)
        .bind(level)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Notification::from))
    }

    async fn set_escalation_job(&self, id: i64, handle: Option<&JobHandle>) -> Result<()> {
        sqlx::query("UPDATE notifications SET escalation_job_id = $2 WHERE id = $1")
            .bind(id)
            .bind(handle.map(|handle| handle.0.as_str()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn acknowledge_by_token(&self, token: &str, now: DateTime<Utc>) -> Result<AckResult> {
        let mut tx = self.pool.begin().await?;
        let row: Option<NotificationRow> = sqlx::query_as(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE email_token = $1 FOR UPDATE"
        ))
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(AckResult::NotFound);
        };
        if row.acknowledged_at.is_some() {
            return Ok(AckResult::AlreadyAcknowledged(row.into()));
        }
        if row.token_expires_at.is_some_and(|expires| expires < now) {
            return Ok(AckResult::Expired);
        }

        let updated: NotificationRow = sqlx::query_as(&format!(
            "UPDATE notifications SET acknowledged_at = $2, is_read = TRUE \
             WHERE id = $1 RETURNING {NOTIFICATION_COLUMNS}"
        ))
        .bind(row.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(AckResult::Acknowledged(updated.into()))
    }
}

#[async_trait]
impl RecipientDirectory for PgNotificationRepository {
    async fn resolve(&self, selector: &RecipientSelector) -> Result<Vec<Recipient>> {
        let rows: Vec<UserRow> = match selector {
            RecipientSelector::Users { user_ids } => {
                if user_ids.is_empty() {
                    return Ok(Vec::new());
                }
                sqlx::query_as(
                    "SELECT id, email, name FROM users WHERE id = ANY($1) AND is_active = TRUE \
                     ORDER BY id ASC",
                )
                .bind(user_ids)
                .fetch_all(&self.pool)
                .await?
            }
            RecipientSelector::Location { location_id } => {
                sqlx::query_as(
                    "SELECT id, email, name FROM users WHERE location_id = $1 AND is_active = TRUE \
                     ORDER BY id ASC",
                )
                .bind(location_id)
                .fetch_all(&self.pool)
                .await?
            }
            RecipientSelector::Line { line_id } => {
                sqlx::query_as(
                    r#"
                    SELECT u.id, u.email, u.name
                    FROM lines l
                    JOIN users u ON u.location_id = l.location_id
                    WHERE l.id = $1
                      AND u.is_active = TRUE
                    ORDER BY u.id ASC
                    "#,
                )
                .bind(line_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(Recipient::from).collect())
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<Recipient>> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, email, name FROM users WHERE id = $1 AND is_active = TRUE")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Recipient::from))
    }
}
