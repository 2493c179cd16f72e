use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::services::aggregation::{
    AggregationService, AggregationSweepService, EfficiencyRecalculator,
    HttpEfficiencyRecalculator, PgEpisodeRepository,
};
use crate::services::delivery::RelayNotificationSink;
use crate::services::jobs::{JobQueue, JobWorker, PgJobQueue};
use crate::services::mqtt::MqttPublisher;
use crate::services::notifications::{NotificationEngine, PgNotificationRepository};

#[derive(Clone)]
pub struct MonitorState {
    pub config: MonitorConfig,
    pub db: PgPool,
    pub http: Client,
    pub queue: Arc<PgJobQueue>,
    pub aggregation: Arc<AggregationService>,
    pub notifications: Arc<NotificationEngine>,
}

impl MonitorState {
    pub fn new(
        config: MonitorConfig,
        db: PgPool,
        http: Client,
        mqtt: Option<Arc<MqttPublisher>>,
    ) -> Self {
        let queue = Arc::new(PgJobQueue::new(db.clone(), config.retry_policy()));

        let episodes = Arc::new(PgEpisodeRepository::new(db.clone()));
        let efficiency = config.efficiency_base_url.as_deref().map(|url| {
            Arc::new(HttpEfficiencyRecalculator::new(http.clone(), url))
                as Arc<dyn EfficiencyRecalculator>
        });
        let aggregation = Arc::new(AggregationService::new(
            episodes.clone(),
            episodes.clone(),
            episodes,
            efficiency,
        ));

        let repository = Arc::new(PgNotificationRepository::new(db.clone()));
        let sink = Arc::new(RelayNotificationSink::new(
            http.clone(),
            config.mail_relay_url.clone(),
            config.mail_from.clone(),
            mqtt,
        ));
        let notifications = Arc::new(NotificationEngine::new(
            repository.clone(),
            repository.clone(),
            repository,
            sink,
            queue.clone(),
            config.dispatch_settings(),
        ));

        Self {
            config,
            db,
            http,
            queue,
            aggregation,
            notifications,
        }
    }

    /// One worker per queue so slow aggregation never delays notifications.
    /// The returned tasks finish once `cancel` fires and running jobs drain.
    pub fn start_workers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let config = &self.config;
        let workers = [
            JobWorker::new(
                self.queue.clone(),
                JobQueue::StateDurationCheck,
                self.notifications.duration_gate(),
                config.duration_check_concurrency,
                Duration::from_millis(config.duration_check_poll_interval_ms),
            ),
            JobWorker::new(
                self.queue.clone(),
                JobQueue::EscalationCheck,
                self.notifications.escalation(),
                config.escalation_concurrency,
                Duration::from_millis(config.escalation_poll_interval_ms),
            ),
            JobWorker::new(
                self.queue.clone(),
                JobQueue::AggregationRecalculate,
                self.aggregation.clone(),
                config.aggregation_concurrency,
                Duration::from_millis(config.aggregation_poll_interval_ms),
            ),
        ];
        let handles = workers
            .into_iter()
            .map(|worker| Arc::new(worker).start(cancel.clone()))
            .collect();

        if config.aggregation_sweep_interval_seconds > 0 {
            AggregationSweepService::new(
                self.queue.clone(),
                Duration::from_secs(config.aggregation_sweep_interval_seconds),
            )
            .start(cancel.clone());
        } else {
            tracing::info!("periodic aggregation sweep disabled");
        }
        handles
    }
}
