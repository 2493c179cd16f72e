use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobQueue {
    StateDurationCheck,
    EscalationCheck,
    AggregationRecalculate,
}

impl JobQueue {
    pub const ALL: [JobQueue; 3] = [
        JobQueue::StateDurationCheck,
        JobQueue::EscalationCheck,
        JobQueue::AggregationRecalculate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateDurationCheck => "state_duration_check",
            Self::EscalationCheck => "escalation_check",
            Self::AggregationRecalculate => "aggregation_recalculate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|queue| queue.as_str() == value.trim())
    }

    /// Only aggregation jobs are parked for manual retry once retries run out.
    pub fn dead_letters(self) -> bool {
        matches!(self, Self::AggregationRecalculate)
    }
}

impl fmt::Display for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque scheduler-assigned job id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn as_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(self.0.trim()).ok()
    }
}

impl From<Uuid> for JobHandle {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub handle: JobHandle,
    pub queue: JobQueue,
    pub payload: JsonValue,
    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
}

impl ScheduledJob {
    /// True for a lease reclaim of a job whose last allowed attempt died
    /// with its worker; it is failed without running again.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts > self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    Retrying { run_at: DateTime<Utc> },
    DeadLettered,
    Failed,
}

impl FailureDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retrying { .. } => "retrying",
            Self::DeadLettered => "dead_lettered",
            Self::Failed => "failed",
        }
    }
}
