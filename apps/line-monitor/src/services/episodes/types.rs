use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TagSample {
    pub tag_id: i64,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

impl TagSample {
    pub fn new(tag_id: i64, value: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            tag_id,
            value: value.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EpisodeKind {
    Alarm,
    State,
}

impl EpisodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alarm => "alarm",
            Self::State => "state",
        }
    }
}

/// Identity copied onto every episode cut from one tag within one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeContext {
    pub job_id: i64,
    pub machine_id: i64,
    pub machine_name: String,
    pub tag_id: i64,
    pub tag_name: String,
    pub line_id: i64,
    pub line_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct AlarmEpisode {
    pub job_id: i64,
    pub machine_id: i64,
    pub machine_name: String,
    pub tag_id: i64,
    pub tag_name: String,
    pub line_id: i64,
    pub line_name: String,
    pub alarm_code: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: f64,
    pub reason_id: Option<i64>,
    pub reason_name: Option<String>,
    pub note: Option<String>,
    pub processed: bool,
}

impl AlarmEpisode {
    pub fn has_annotation(&self) -> bool {
        self.reason_id.is_some() || self.note.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MachineStateEpisode {
    pub job_id: i64,
    pub machine_id: i64,
    pub machine_name: String,
    pub tag_id: i64,
    pub tag_name: String,
    pub line_id: i64,
    pub line_name: String,
    pub state_code: i32,
    pub state_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub user_note: Option<String>,
    pub processed: bool,
}
