use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::MonitorConfig;

/// Connections beyond the worker permits, for claims, sweeps and one-shot modes.
const POOL_HEADROOM: u32 = 4;

/// Enough connections for every job permit to hold one while it runs.
pub fn pool_size(config: &MonitorConfig) -> u32 {
    let permits = config
        .duration_check_concurrency
        .max(1)
        .saturating_add(config.escalation_concurrency.max(1))
        .saturating_add(config.aggregation_concurrency.max(1));
    u32::try_from(permits)
        .unwrap_or(u32::MAX)
        .saturating_add(POOL_HEADROOM)
}

pub fn connect_lazy(config: &MonitorConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(pool_size(config))
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(&config.database_url)
        .context("failed to create lazy line-monitor database pool")
}
