use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::jobs::JobHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    ValueChange,
    Threshold,
    StateChange,
}

impl ConditionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValueChange => "value_change",
            Self::Threshold => "threshold",
            Self::StateChange => "state_change",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "value_change" => Some(Self::ValueChange),
            "threshold" => Some(Self::Threshold),
            "state_change" => Some(Self::StateChange),
            _ => None,
        }
    }
}

/// Who receives a rule's level-0 notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecipientSelector {
    Users { user_ids: Vec<i64> },
    Location { location_id: i64 },
    Line { line_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: i64,
    pub name: String,
    pub tag_id: i64,
    pub condition_type: ConditionType,
    pub threshold_value: Option<f64>,
    pub comparison_operator: Option<String>,
    pub target_state: Option<String>,
    pub state_duration: Option<i64>,
    pub state_duration_unit: Option<String>,
    pub cooldown_minutes: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub message_template: Option<String>,
    pub send_email: bool,
    pub send_in_app: bool,
    pub recipients: RecipientSelector,
    pub enable_escalation: bool,
    pub escalation_delay: Option<i64>,
    pub escalation_delay_unit: Option<String>,
    pub escalation_user_ids: Vec<i64>,
    pub max_escalation_level: i32,
}

impl NotificationEvent {
    /// Escalation rides on email; without it there is no one to chase.
    pub fn escalation_enabled(&self) -> bool {
        self.enable_escalation
            && self.send_email
            && !self.escalation_user_ids.is_empty()
            && self.max_escalation_level > 0
    }

    pub fn requires_duration_gate(&self) -> bool {
        self.condition_type == ConditionType::StateChange
            && self.state_duration.is_some_and(|duration| duration > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub event_id: i64,
    pub user_id: i64,
    pub message: String,
    pub tag_value: String,
    pub old_tag_value: Option<String>,
    pub is_read: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub escalation_level: i32,
    pub parent_notification_id: Option<i64>,
    pub escalation_job_id: Option<JobHandle>,
    pub email_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub event_id: i64,
    pub user_id: i64,
    pub message: String,
    pub tag_value: String,
    pub old_tag_value: Option<String>,
    pub escalation_level: i32,
    pub parent_notification_id: Option<i64>,
    pub email_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    pub email: Option<String>,
    pub name: String,
}

/// A new sample for a tag, as handed over by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValueChange {
    pub tag_id: i64,
    pub new_value: Option<String>,
    pub old_value: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckResult {
    Acknowledged(Notification),
    AlreadyAcknowledged(Notification),
    Expired,
    NotFound,
}

impl AckResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledged(_) => "acknowledged",
            Self::AlreadyAcknowledged(_) => "already_acknowledged",
            Self::Expired => "expired",
            Self::NotFound => "not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recipient_selector_uses_tagged_json() {
        let selector: RecipientSelector =
            serde_json::from_value(json!({"kind": "users", "user_ids": [4, 7]})).expect("users");
        assert_eq!(selector, RecipientSelector::Users { user_ids: vec![4, 7] });
        let selector: RecipientSelector =
            serde_json::from_value(json!({"kind": "line", "line_id": 2})).expect("line");
        assert_eq!(selector, RecipientSelector::Line { line_id: 2 });
        assert!(serde_json::from_value::<RecipientSelector>(json!({"kind": "everyone"})).is_err());
    }

    #[test]
    fn condition_type_parses_stored_names() {
        for kind in [
            ConditionType::ValueChange,
            ConditionType::Threshold,
            ConditionType::StateChange,
        ] {
            assert_eq!(ConditionType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ConditionType::parse("rate_of_change"), None);
    }
}
