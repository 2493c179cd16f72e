use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::jobs::RetryPolicy;
use crate::services::notifications::DispatchSettings;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/line-monitor/config.json";

pub(crate) fn setup_config_path() -> PathBuf {
    env_optional_string("LINE_MONITOR_SETUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

/// Installer-written settings; environment variables win over these.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mail_relay_url: Option<String>,
    #[serde(default)]
    mail_from: Option<String>,
    #[serde(default)]
    ack_base_url: Option<String>,
    #[serde(default)]
    efficiency_base_url: Option<String>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_url: String,
    pub mqtt_enabled: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mail_relay_url: Option<String>,
    pub mail_from: String,
    pub ack_base_url: Option<String>,
    pub efficiency_base_url: Option<String>,
    pub token_ttl_hours: u64,
    pub duration_check_concurrency: usize,
    pub duration_check_poll_interval_ms: u64,
    pub escalation_concurrency: usize,
    pub escalation_poll_interval_ms: u64,
    pub aggregation_concurrency: usize,
    pub aggregation_poll_interval_ms: u64,
    pub job_max_attempts: u32,
    pub job_backoff_base_seconds: u64,
    pub job_backoff_cap_seconds: u64,
    pub aggregation_sweep_interval_seconds: u64,
    /// A `running` job whose claim is older than this is handed out again.
    pub job_lease_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let overrides = load_setup_config_overrides(&setup_config_path()).unwrap_or_default();
        Self::from_env_with(&overrides)
    }

    fn from_env_with(overrides: &SetupConfigOverrides) -> Result<Self> {
        let database_url = env_or_override("LINE_MONITOR_DATABASE_URL", &overrides.database_url)
            .context("LINE_MONITOR_DATABASE_URL must be set (or present as database_url in the setup config)")?;

        let config = Self {
            database_url,
            mqtt_enabled: env_bool("LINE_MONITOR_MQTT_ENABLED", true),
            mqtt_host: env_or_override("LINE_MONITOR_MQTT_HOST", &overrides.mqtt_host)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: env_optional_string("LINE_MONITOR_MQTT_PORT")
                .and_then(|value| value.parse::<u16>().ok())
                .or(overrides.mqtt_port.filter(|port| *port != 0))
                .unwrap_or(1883),
            mqtt_username: env_or_override("LINE_MONITOR_MQTT_USERNAME", &overrides.mqtt_username),
            mqtt_password: env_or_override("LINE_MONITOR_MQTT_PASSWORD", &overrides.mqtt_password),
            mqtt_topic_prefix: env_string("LINE_MONITOR_MQTT_TOPIC_PREFIX", "line-monitor"),
            mail_relay_url: env_or_override("LINE_MONITOR_MAIL_RELAY_URL", &overrides.mail_relay_url),
            mail_from: env_or_override("LINE_MONITOR_MAIL_FROM", &overrides.mail_from)
                .unwrap_or_else(|| "line-monitor@localhost".to_string()),
            ack_base_url: env_or_override("LINE_MONITOR_ACK_BASE_URL", &overrides.ack_base_url),
            efficiency_base_url: env_or_override(
                "LINE_MONITOR_EFFICIENCY_BASE_URL",
                &overrides.efficiency_base_url,
            ),
            token_ttl_hours: env_u64("LINE_MONITOR_TOKEN_TTL_HOURS", 72),
            duration_check_concurrency: env_usize("LINE_MONITOR_DURATION_CHECK_CONCURRENCY", 5),
            duration_check_poll_interval_ms: env_u64(
                "LINE_MONITOR_DURATION_CHECK_POLL_INTERVAL_MS",
                1_000,
            ),
            escalation_concurrency: env_usize("LINE_MONITOR_ESCALATION_CONCURRENCY", 5),
            escalation_poll_interval_ms: env_u64("LINE_MONITOR_ESCALATION_POLL_INTERVAL_MS", 1_000),
            aggregation_concurrency: env_usize("LINE_MONITOR_AGGREGATION_CONCURRENCY", 1),
            aggregation_poll_interval_ms: env_u64(
                "LINE_MONITOR_AGGREGATION_POLL_INTERVAL_MS",
                5_000,
            ),
            job_max_attempts: env_u32("LINE_MONITOR_JOB_MAX_ATTEMPTS", 3),
            job_backoff_base_seconds: env_u64("LINE_MONITOR_JOB_BACKOFF_BASE_SECONDS", 5),
            job_backoff_cap_seconds: env_u64("LINE_MONITOR_JOB_BACKOFF_CAP_SECONDS", 300),
            aggregation_sweep_interval_seconds: env_u64(
                "LINE_MONITOR_AGGREGATION_SWEEP_INTERVAL_SECONDS",
                900,
            ),
            job_lease_seconds: env_u64("LINE_MONITOR_JOB_LEASE_SECONDS", 600),
            shutdown_grace_seconds: env_u64("LINE_MONITOR_SHUTDOWN_GRACE_SECONDS", 30),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_ttl_hours == 0 {
            anyhow::bail!("LINE_MONITOR_TOKEN_TTL_HOURS must be greater than zero");
        }
        if self.job_lease_seconds == 0 {
            anyhow::bail!("LINE_MONITOR_JOB_LEASE_SECONDS must be greater than zero");
        }
        if self.job_max_attempts == 0 {
            anyhow::bail!("LINE_MONITOR_JOB_MAX_ATTEMPTS must be at least 1");
        }
        if self.job_backoff_base_seconds > self.job_backoff_cap_seconds {
            anyhow::bail!(
                "job backoff base ({}s) exceeds its cap ({}s)",
                self.job_backoff_base_seconds,
                self.job_backoff_cap_seconds
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: i32::try_from(self.job_max_attempts).unwrap_or(i32::MAX),
            backoff_base: Duration::from_secs(self.job_backoff_base_seconds),
            backoff_cap: Duration::from_secs(self.job_backoff_cap_seconds),
            lease: Duration::from_secs(self.job_lease_seconds),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            token_ttl: i64::try_from(self.token_ttl_hours)
                .ok()
                .and_then(chrono::Duration::try_hours)
                .unwrap_or_else(|| chrono::Duration::hours(72)),
            ack_base_url: self.ack_base_url.clone(),
        }
    }
}

fn env_or_override(key: &str, override_value: &Option<String>) -> Option<String> {
    env_optional_string(key).or_else(|| {
        override_value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string())
    })
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
