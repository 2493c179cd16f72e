use anyhow::{Context, Result};
use clap::Parser;
use line_monitor::services::jobs::JobHandle;
use line_monitor::services::mqtt::MqttPublisher;
use line_monitor::{cli, config, db, state};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::MonitorConfig::from_env()?;
    let pool = db::connect_lazy(&config)?;
    let http = reqwest::Client::new();
    let cancel = CancellationToken::new();

    if let Some(job_id) = args.recalculate {
        let state = state::MonitorState::new(config, pool, http, None);
        let report = state
            .aggregation
            .recalculate(Some(job_id))
            .await
            .with_context(|| format!("recalculation of job {job_id} failed"))?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if args.once {
        let state = state::MonitorState::new(config, pool, http, None);
        let report = state.aggregation.recalculate(None).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if let Some(job_id) = args.retry_dead_letter {
        let state = state::MonitorState::new(config, pool, http, None);
        let requeued = state
            .queue
            .retry_dead_letter(&JobHandle(job_id.clone()))
            .await?;
        if !requeued {
            anyhow::bail!("no dead-lettered job {job_id}");
        }
        tracing::info!(job_id = %job_id, "dead-lettered job requeued");
        return Ok(());
    }

    let mqtt = if config.mqtt_enabled {
        let (publisher, _mqtt_task) = MqttPublisher::new(
            "line-monitor",
            &config.mqtt_host,
            config.mqtt_port,
            config.mqtt_username.as_deref(),
            config.mqtt_password.as_deref(),
            &config.mqtt_topic_prefix,
            cancel.clone(),
        )?;
        Some(Arc::new(publisher))
    } else {
        tracing::info!("mqtt disabled; in-app notifications will not be pushed");
        None
    };

    let grace = config.shutdown_grace();
    let state = state::MonitorState::new(config, pool, http, mqtt);
    let workers = state.start_workers(&cancel);
    tracing::info!("line monitor workers running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    cancel.cancel();

    let drained = tokio::time::timeout(grace, async {
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "job worker task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            grace_seconds = grace.as_secs(),
            "shutdown grace elapsed; unfinished jobs will be reclaimed after their lease"
        );
    }
    Ok(())
}
