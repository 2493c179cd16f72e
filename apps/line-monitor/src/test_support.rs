//! In-memory collaborators for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::MonitorConfig;
use crate::services::aggregation::{
    EfficiencyError, EfficiencyRecalculator, EpisodeStore, JobDirectory, MachineTags,
    ProductionJob, SampleReader, TagRef,
};
use crate::services::episodes::{AlarmEpisode, EpisodeKind, MachineStateEpisode, TagSample};
use crate::services::jobs::{JobHandle, JobQueue, JobScheduler, ScheduledJob};
use crate::services::notifications::{
    AckResult, ConditionType, DispatchSettings, NewNotification, Notification, NotificationEngine,
    NotificationEvent, NotificationSink, NotificationStore, Recipient, RecipientDirectory,
    RecipientSelector, RuleStore, TagValueChange,
};

/// Worker settings at their defaults, MQTT and mail off.
pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        database_url: "postgresql://postgres@localhost/line_monitor".to_string(),
        mqtt_enabled: false,
        mqtt_host: "127.0.0.1".to_string(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_topic_prefix: "line-monitor".to_string(),
        mail_relay_url: None,
        mail_from: "line-monitor@localhost".to_string(),
        ack_base_url: None,
        efficiency_base_url: None,
        token_ttl_hours: 72,
        duration_check_concurrency: 5,
        duration_check_poll_interval_ms: 1_000,
        escalation_concurrency: 5,
        escalation_poll_interval_ms: 1_000,
        aggregation_concurrency: 1,
        aggregation_poll_interval_ms: 5_000,
        job_max_attempts: 3,
        job_backoff_base_seconds: 5,
        job_backoff_cap_seconds: 300,
        aggregation_sweep_interval_seconds: 900,
        job_lease_seconds: 600,
        shutdown_grace_seconds: 30,
    }
}

pub const RULE_TAG: i64 = 7;

pub fn minutes_after(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 9, 6, 0, 0).unwrap() + Duration::minutes(minutes)
}

// ---------------------------------------------------------------------------
// aggregation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PlantState {
    jobs: BTreeMap<i64, ProductionJob>,
    machines: BTreeMap<i64, Vec<MachineTags>>,
    samples: HashMap<i64, Vec<TagSample>>,
    failing_tags: HashSet<i64>,
}

/// Jobs, machines, and samples; shares its episode tables with
/// [`MemoryEpisodes`] so sweeps see what earlier runs stored.
pub struct MemoryPlant {
    state: Mutex<PlantState>,
    episodes: Arc<MemoryEpisodes>,
}

impl MemoryPlant {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlantState::default()),
            episodes: Arc::new(MemoryEpisodes::default()),
        }
    }

    pub fn episodes(&self) -> Arc<MemoryEpisodes> {
        self.episodes.clone()
    }

    pub fn add_job(
        &self,
        id: i64,
        line_id: i64,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) {
        self.state.lock().unwrap().jobs.insert(
            id,
            ProductionJob {
                id,
                line_id,
                line_name: format!("Line {line_id}"),
                actual_start_time: start,
                actual_end_time: end,
            },
        );
    }

    pub fn add_machine(
        &self,
        line_id: i64,
        machine_id: i64,
        name: &str,
        alarm_tags: &[(i64, &str)],
        state_tag: Option<(i64, &str)>,
    ) {
        let tag = |(id, name): (i64, &str)| TagRef {
            id,
            name: name.to_string(),
        };
        self.state
            .lock()
            .unwrap()
            .machines
            .entry(line_id)
            .or_default()
            .push(MachineTags {
                machine_id,
                machine_name: name.to_string(),
                alarm_tags: alarm_tags.iter().copied().map(tag).collect(),
                state_tag: state_tag.map(tag),
            });
    }

    pub fn add_samples(&self, tag_id: i64, samples: &[(&str, i64)]) {
        let mut state = self.state.lock().unwrap();
        let entry = state.samples.entry(tag_id).or_default();
        entry.extend(
            samples
                .iter()
                .map(|(value, minute)| TagSample::new(tag_id, *value, minutes_after(*minute))),
        );
        entry.sort_by_key(|sample| sample.timestamp);
    }

    pub fn fail_samples_for(&self, tag_id: i64) {
        self.state.lock().unwrap().failing_tags.insert(tag_id);
    }
}

#[async_trait]
impl SampleReader for MemoryPlant {
    async fn samples(
        &self,
        tag_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TagSample>> {
        let state = self.state.lock().unwrap();
        if state.failing_tags.contains(&tag_id) {
            anyhow::bail!("sample store unavailable for tag {tag_id}");
        }
        Ok(state
            .samples
            .get(&tag_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|sample| sample.timestamp >= from && sample.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl JobDirectory for MemoryPlant {
    async fn get_job(&self, job_id: i64) -> Result<Option<ProductionJob>> {
        Ok(self.state.lock().unwrap().jobs.get(&job_id).cloned())
    }

    async fn line_machines(&self, line_id: i64) -> Result<Vec<MachineTags>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .machines
            .get(&line_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn jobs_needing_aggregation(&self, kind: EpisodeKind) -> Result<Vec<i64>> {
        let candidates: Vec<i64> = self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|job| job.actual_start_time.is_some() && job.actual_end_time.is_some())
            .map(|job| job.id)
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|job_id| !self.episodes.has_episodes(*job_id, kind))
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryEpisodes {
    alarms: Mutex<BTreeMap<i64, Vec<AlarmEpisode>>>,
    states: Mutex<BTreeMap<i64, Vec<MachineStateEpisode>>>,
}

impl MemoryEpisodes {
    pub fn alarms(&self, job_id: i64) -> Vec<AlarmEpisode> {
        self.alarms
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn states(&self, job_id: i64) -> Vec<MachineStateEpisode> {
        self.states
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sets a user annotation on every stored alarm episode with `code`.
    pub fn annotate(
        &self,
        job_id: i64,
        code: &str,
        reason_id: Option<i64>,
        reason_name: Option<&str>,
        note: Option<&str>,
    ) {
        let mut alarms = self.alarms.lock().unwrap();
        for episode in alarms.entry(job_id).or_default() {
            if episode.alarm_code == code {
                episode.reason_id = reason_id;
                episode.reason_name = reason_name.map(str::to_string);
                episode.note = note.map(str::to_string);
            }
        }
    }

    fn has_episodes(&self, job_id: i64, kind: EpisodeKind) -> bool {
        match kind {
            EpisodeKind::Alarm => self
                .alarms
                .lock()
                .unwrap()
                .get(&job_id)
                .is_some_and(|episodes| !episodes.is_empty()),
            EpisodeKind::State => self
                .states
                .lock()
                .unwrap()
                .get(&job_id)
                .is_some_and(|episodes| !episodes.is_empty()),
        }
    }
}

#[async_trait]
impl EpisodeStore for MemoryEpisodes {
    async fn annotated_alarm_episodes(&self, job_id: i64) -> Result<Vec<AlarmEpisode>> {
        Ok(self
            .alarms(job_id)
            .into_iter()
            .filter(AlarmEpisode::has_annotation)
            .collect())
    }

    async fn stored_tag_episodes(
        &self,
        job_id: i64,
        alarm_tags: &[i64],
        state_tags: &[i64],
    ) -> Result<(Vec<AlarmEpisode>, Vec<MachineStateEpisode>)> {
        let alarms = self
            .alarms(job_id)
            .into_iter()
            .filter(|episode| alarm_tags.contains(&episode.tag_id))
            .collect();
        let states = self
            .states(job_id)
            .into_iter()
            .filter(|episode| state_tags.contains(&episode.tag_id))
            .collect();
        Ok((alarms, states))
    }

    async fn replace_job_episodes(
        &self,
        job_id: i64,
        alarms: &[AlarmEpisode],
        states: &[MachineStateEpisode],
    ) -> Result<()> {
        let mut stored_alarms = self.alarms.lock().unwrap();
        let mut stored_states = self.states.lock().unwrap();
        stored_alarms.insert(job_id, alarms.to_vec());
        stored_states.insert(job_id, states.to_vec());
        Ok(())
    }
}

enum EfficiencyMode {
    Succeed,
    Fail,
    JobMissing,
}

pub struct MemoryEfficiency {
    mode: EfficiencyMode,
    calls: Mutex<Vec<i64>>,
}

impl MemoryEfficiency {
    pub fn succeeding() -> Self {
        Self::with_mode(EfficiencyMode::Succeed)
    }

    pub fn failing() -> Self {
        Self::with_mode(EfficiencyMode::Fail)
    }

    pub fn job_missing() -> Self {
        Self::with_mode(EfficiencyMode::JobMissing)
    }

    fn with_mode(mode: EfficiencyMode) -> Self {
        Self {
            mode,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EfficiencyRecalculator for MemoryEfficiency {
    async fn recalculate(&self, job_id: i64) -> Result<(), EfficiencyError> {
        self.calls.lock().unwrap().push(job_id);
        match self.mode {
            EfficiencyMode::Succeed => Ok(()),
            EfficiencyMode::Fail => Err(EfficiencyError::Failed(anyhow::anyhow!(
                "efficiency service timed out"
            ))),
            EfficiencyMode::JobMissing => Err(EfficiencyError::JobMissing(job_id)),
        }
    }
}

// ---------------------------------------------------------------------------
// notifications
// ---------------------------------------------------------------------------

pub fn notification_rule(id: i64, condition_type: ConditionType) -> NotificationEvent {
    NotificationEvent {
        id,
        name: format!("Rule {id}"),
        tag_id: RULE_TAG,
        condition_type,
        threshold_value: None,
        comparison_operator: None,
        target_state: None,
        state_duration: None,
        state_duration_unit: None,
        cooldown_minutes: 0,
        last_triggered_at: None,
        is_active: true,
        message_template: None,
        send_email: true,
        send_in_app: true,
        recipients: RecipientSelector::Users { user_ids: vec![1] },
        enable_escalation: false,
        escalation_delay: None,
        escalation_delay_unit: None,
        escalation_user_ids: Vec::new(),
        max_escalation_level: 0,
    }
}

pub fn tag_change(new_value: Option<&str>, old_value: Option<&str>) -> TagValueChange {
    TagValueChange {
        tag_id: RULE_TAG,
        new_value: new_value.map(str::to_string),
        old_value: old_value.map(str::to_string),
        timestamp: minutes_after(0),
    }
}

#[derive(Default)]
pub struct MemoryRules {
    rules: Mutex<BTreeMap<i64, NotificationEvent>>,
    tag_values: Mutex<HashMap<i64, String>>,
}

impl MemoryRules {
    pub fn insert(&self, rule: NotificationEvent) {
        self.rules.lock().unwrap().insert(rule.id, rule);
    }

    pub fn rule(&self, id: i64) -> NotificationEvent {
        self.rules
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .expect("rule exists")
    }

    pub fn set_tag_value(&self, tag_id: i64, value: Option<&str>) {
        let mut values = self.tag_values.lock().unwrap();
        match value {
            Some(value) => values.insert(tag_id, value.to_string()),
            None => values.remove(&tag_id),
        };
    }
}

#[async_trait]
impl RuleStore for MemoryRules {
    async fn active_rules_for_tag(&self, tag_id: i64) -> Result<Vec<NotificationEvent>> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .values()
            .filter(|rule| rule.tag_id == tag_id && rule.is_active)
            .cloned()
            .collect())
    }

    async fn get_rule(&self, event_id: i64) -> Result<Option<NotificationEvent>> {
        Ok(self.rules.lock().unwrap().get(&event_id).cloned())
    }

    async fn current_tag_value(&self, tag_id: i64) -> Result<Option<String>> {
        Ok(self.tag_values.lock().unwrap().get(&tag_id).cloned())
    }

    async fn mark_triggered(&self, event_id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(rule) = self.rules.lock().unwrap().get_mut(&event_id) {
            rule.last_triggered_at = Some(at);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNotifications {
    rows: Mutex<Vec<Notification>>,
}

impl MemoryNotifications {
    pub fn all(&self) -> Vec<Notification> {
        self.rows.lock().unwrap().clone()
    }

    pub fn escalations(&self) -> Vec<Notification> {
        self.all()
            .into_iter()
            .filter(|row| row.escalation_level > 0)
            .collect()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotifications {
    async fn create_notifications(&self, batch: &[NewNotification]) -> Result<Vec<Notification>> {
        let mut rows = self.rows.lock().unwrap();
        let mut created = Vec::with_capacity(batch.len());
        for item in batch {
            let notification = Notification {
                id: rows.len() as i64 + 1,
                event_id: item.event_id,
                user_id: item.user_id,
                message: item.message.clone(),
                tag_value: item.tag_value.clone(),
                old_tag_value: item.old_tag_value.clone(),
                is_read: false,
                acknowledged_at: None,
                escalation_level: item.escalation_level,
                parent_notification_id: item.parent_notification_id,
                escalation_job_id: None,
                email_token: item.email_token.clone(),
                token_expires_at: item.token_expires_at,
                created_at: Utc::now(),
            };
            rows.push(notification.clone());
            created.push(notification);
        }
        Ok(created)
    }

    async fn get_notification(&self, id: i64) -> Result<Option<Notification>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id)
            .cloned())
    }

    async fn find_escalation(&self, parent_id: i64, level: i32) -> Result<Option<Notification>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| {
                row.parent_notification_id == Some(parent_id) && row.escalation_level == level
            })
            .cloned())
    }

    async fn set_escalation_job(&self, id: i64, handle: Option<&JobHandle>) -> Result<()> {
        if let Some(row) = self.rows.lock().unwrap().iter_mut().find(|row| row.id == id) {
            row.escalation_job_id = handle.cloned();
        }
        Ok(())
    }

    async fn acknowledge_by_token(&self, token: &str, now: DateTime<Utc>) -> Result<AckResult> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows
            .iter_mut()
            .find(|row| row.email_token.as_deref() == Some(token))
        else {
            return Ok(AckResult::NotFound);
        };
        if row.acknowledged_at.is_some() {
            return Ok(AckResult::AlreadyAcknowledged(row.clone()));
        }
        if row.token_expires_at.is_some_and(|expires| expires < now) {
            return Ok(AckResult::Expired);
        }
        row.acknowledged_at = Some(now);
        row.is_read = true;
        Ok(AckResult::Acknowledged(row.clone()))
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    users: Mutex<BTreeMap<i64, Recipient>>,
    locations: Mutex<HashMap<i64, Vec<i64>>>,
    lines: Mutex<HashMap<i64, i64>>,
    failing_locations: Mutex<HashSet<i64>>,
}

impl MemoryDirectory {
    pub fn add_user(&self, id: i64, email: Option<&str>) {
        self.users.lock().unwrap().insert(
            id,
            Recipient {
                id,
                email: email.map(str::to_string),
                name: format!("User {id}"),
            },
        );
    }

    pub fn assign_location(&self, location_id: i64, user_ids: &[i64]) {
        self.locations
            .lock()
            .unwrap()
            .insert(location_id, user_ids.to_vec());
    }

    pub fn assign_line(&self, line_id: i64, location_id: i64) {
        self.lines.lock().unwrap().insert(line_id, location_id);
    }

    /// Resolving this location returns an error.
    pub fn fail_location(&self, location_id: i64) {
        self.failing_locations.lock().unwrap().insert(location_id);
    }

    fn users_in(&self, ids: &[i64]) -> Vec<Recipient> {
        let users = self.users.lock().unwrap();
        ids.iter().filter_map(|id| users.get(id).cloned()).collect()
    }
}

#[async_trait]
impl RecipientDirectory for MemoryDirectory {
    async fn resolve(&self, selector: &RecipientSelector) -> Result<Vec<Recipient>> {
        if let RecipientSelector::Location { location_id } = selector {
            if self.failing_locations.lock().unwrap().contains(location_id) {
                anyhow::bail!("directory unavailable for location {location_id}");
            }
        }
        let ids = match selector {
            RecipientSelector::Users { user_ids } => user_ids.clone(),
            RecipientSelector::Location { location_id } => self
                .locations
                .lock()
                .unwrap()
                .get(location_id)
                .cloned()
                .unwrap_or_default(),
            RecipientSelector::Line { line_id } => {
                let location = self.lines.lock().unwrap().get(line_id).copied();
                location
                    .and_then(|location| self.locations.lock().unwrap().get(&location).cloned())
                    .unwrap_or_default()
            }
        };
        Ok(self.users_in(&ids))
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<Recipient>> {
        Ok(self.users.lock().unwrap().get(&user_id).cloned())
    }
}

#[derive(Default)]
pub struct MemorySink {
    emails: Mutex<Vec<(String, String, String)>>,
    published: Mutex<Vec<(String, JsonValue)>>,
    failing: Mutex<HashSet<String>>,
}

impl MemorySink {
    pub fn fail_email_to(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn emails(&self) -> Vec<(String, String, String)> {
        self.emails.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, JsonValue)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(to) {
            anyhow::bail!("smtp relay rejected {to}");
        }
        self.emails
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), html.to_string()));
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &JsonValue) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryScheduler {
    pending: Mutex<Vec<ScheduledJob>>,
    delays: Mutex<Vec<(JobQueue, std::time::Duration)>>,
    next_id: Mutex<u64>,
}

impl MemoryScheduler {
    pub fn pending_count(&self, queue: JobQueue) -> usize {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.queue == queue)
            .count()
    }

    pub fn delays(&self) -> Vec<(JobQueue, std::time::Duration)> {
        self.delays.lock().unwrap().clone()
    }

    /// Removes the oldest pending job of `queue`, as a worker claim would.
    pub fn take_next(&self, queue: JobQueue) -> Option<ScheduledJob> {
        let mut pending = self.pending.lock().unwrap();
        let index = pending.iter().position(|job| job.queue == queue)?;
        Some(pending.remove(index))
    }
}

#[async_trait]
impl JobScheduler for MemoryScheduler {
    async fn schedule(
        &self,
        queue: JobQueue,
        payload: JsonValue,
        delay: std::time::Duration,
    ) -> Result<JobHandle> {
        let handle = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            JobHandle(format!("job-{next_id}"))
        };
        self.delays.lock().unwrap().push((queue, delay));
        self.pending.lock().unwrap().push(ScheduledJob {
            handle: handle.clone(),
            queue,
            payload,
            run_at: Utc::now() + Duration::from_std(delay)?,
            attempts: 0,
            max_attempts: 3,
        });
        Ok(handle)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<bool> {
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|job| &job.handle != handle);
        Ok(pending.len() != before)
    }

    async fn pending(&self, queue: JobQueue) -> Result<Vec<ScheduledJob>> {
        Ok(self
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.queue == queue)
            .cloned()
            .collect())
    }
}

pub struct NotificationHarness {
    pub rules: Arc<MemoryRules>,
    pub notifications: Arc<MemoryNotifications>,
    pub directory: Arc<MemoryDirectory>,
    pub sink: Arc<MemorySink>,
    pub scheduler: Arc<MemoryScheduler>,
    pub engine: NotificationEngine,
}

impl NotificationHarness {
    /// Users 1 through 6, each with `user<N>@plant.test`.
    pub fn new() -> Self {
        let rules = Arc::new(MemoryRules::default());
        let notifications = Arc::new(MemoryNotifications::default());
        let directory = Arc::new(MemoryDirectory::default());
        for id in 1..=6 {
            directory.add_user(id, Some(&format!("user{id}@plant.test")));
        }
        let sink = Arc::new(MemorySink::default());
        let scheduler = Arc::new(MemoryScheduler::default());
        let engine = NotificationEngine::new(
            rules.clone(),
            notifications.clone(),
            directory.clone(),
            sink.clone(),
            scheduler.clone(),
            DispatchSettings::default(),
        );
        Self {
            rules,
            notifications,
            directory,
            sink,
            scheduler,
            engine,
        }
    }
}
