use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EfficiencyError {
    #[error("job {0} no longer exists")]
    JobMissing(i64),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Rebuilds the per-minute efficiency series derived from a job's episodes.
#[async_trait]
pub trait EfficiencyRecalculator: Send + Sync {
    async fn recalculate(&self, job_id: i64) -> Result<(), EfficiencyError>;
}

#[derive(Debug, Clone)]
pub struct HttpEfficiencyRecalculator {
    http: reqwest::Client,
    base_url: String,
}

impl HttpEfficiencyRecalculator {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn job_url(&self, job_id: i64) -> String {
        format!("{}/jobs/{job_id}/efficiency/recalculate", self.base_url)
    }
}

#[async_trait]
impl EfficiencyRecalculator for HttpEfficiencyRecalculator {
    async fn recalculate(&self, job_id: i64) -> Result<(), EfficiencyError> {
        let response = self
            .http
            .post(self.job_url(job_id))
            .send()
            .await
            .map_err(|err| EfficiencyError::Failed(err.into()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(EfficiencyError::JobMissing(job_id)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(EfficiencyError::Failed(anyhow::anyhow!(
                    "efficiency service returned {status}: {}",
                    body.trim()
                )))
            }
        }
    }
}
