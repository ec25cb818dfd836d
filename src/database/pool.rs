//! Postgres pool shared by the repositories

use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::{AppError, Result};

/// Handle to the service's Postgres pool; cheap to clone
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Snapshot reported on `/api/status`
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub max: u32,
}

/// Pool options from config. A zero idle timeout or lifetime disables it.
fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    let secs = |value: u64| (value > 0).then(|| Duration::from_secs(value));

    PgPoolOptions::new()
        .min_connections(config.min_connections.min(config.max_connections))
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(secs(config.idle_timeout_secs))
        .max_lifetime(secs(config.max_lifetime_secs))
}

impl Database {
    /// Open the pool and wait for the first connection
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            host = %config.host,
            database = %config.name,
            from_url = config.url.is_some(),
            max_connections = config.max_connections,
            "Connecting to database"
        );

        let pool = pool_options(config)
            .connect(&config.connection_url())
            .await
            .map_err(|e| AppError::DatabaseConnection(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Build the pool without connecting; connections open on first use
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let pool = pool_options(config)
            .connect_lazy(&config.connection_url())
            .map_err(|e| AppError::DatabaseConnection(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip a trivial query; returns its latency
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(start.elapsed())
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            max: self.pool.options().get_max_connections(),
        }
    }

    /// Apply pending schema migrations
    pub async fn run_migrations(&self) -> Result<()> {
        super::migrations::run_migrations(&self.pool).await
    }

    /// Wait for checked-out connections to return, then close the pool
    pub async fn close(&self) {
        if self.pool.is_closed() {
            warn!("Database pool already closed");
            return;
        }
        self.pool.close().await;
        info!("Database pool closed");
    }
}
