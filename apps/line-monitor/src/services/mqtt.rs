use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Live-push transport for in-app notifications.
#[derive(Debug)]
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttPublisher {
    pub fn new(
        client_id: &str,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        topic_prefix: &str,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(10));
        if let (Some(username), Some(password)) = (username, password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => {
                        if let Err(err) = event {
                            tracing::warn!(error = %err, "mqtt event loop error");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        });
        Ok((
            Self {
                client,
                topic_prefix: topic_prefix.trim_matches('/').to_string(),
            },
            handle,
        ))
    }

    pub fn topic_for(&self, channel: &str) -> String {
        topic(&self.topic_prefix, channel)
    }

    pub async fn publish_json(&self, channel: &str, payload: &JsonValue) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.client
            .publish(self.topic_for(channel), QoS::AtLeastOnce, false, bytes)
            .await?;
        Ok(())
    }
}

fn topic(prefix: &str, channel: &str) -> String {
    let channel = channel.trim_matches('/');
    if prefix.is_empty() {
        channel.to_string()
    } else {
        format!("{prefix}/{channel}")
    }
}
