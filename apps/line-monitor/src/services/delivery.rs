use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::services::mqtt::MqttPublisher;
use crate::services::notifications::NotificationSink;

#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    to: &'a str,
    from: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Email through an HTTP mail relay, live push over MQTT. Either side may be
/// unconfigured, in which case sends fail and the dispatcher logs them.
pub struct RelayNotificationSink {
    http: reqwest::Client,
    mail_relay_url: Option<String>,
    mail_from: String,
    mqtt: Option<Arc<MqttPublisher>>,
}

impl RelayNotificationSink {
    pub fn new(
        http: reqwest::Client,
        mail_relay_url: Option<String>,
        mail_from: String,
        mqtt: Option<Arc<MqttPublisher>>,
    ) -> Self {
        Self {
            http,
            mail_relay_url,
            mail_from,
            mqtt,
        }
    }
}

#[async_trait]
impl NotificationSink for RelayNotificationSink {
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let Some(url) = self.mail_relay_url.as_deref() else {
            anyhow::bail!("mail relay not configured");
        };
        let response = self
            .http
            .post(url)
            .json(&MailRequest {
                to,
                from: &self.mail_from,
                subject,
                html,
            })
            .send()
            .await
            .with_context(|| format!("mail relay request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("mail relay returned {status}: {}", body.trim());
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &JsonValue) -> Result<()> {
        let Some(mqtt) = &self.mqtt else {
            anyhow::bail!("live push not configured");
        };
        mqtt.publish_json(channel, payload).await
    }
}
