//! Periodic account-pool upkeep.
//!
//! Two sweeps run over every active pool on their own timers: a health
//! sweep that stamps each credential's `last_check_at`, and a refresh sweep
//! that renews tokens before request traffic would have to. Both stop when
//! the cancellation token fires.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::pool::{CredentialPool, RefreshSummary};
use crate::core::config::MaintenanceConfig;
use crate::store::PoolStore;

/// Counts from one health sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub checked: usize,
    pub unhealthy: usize,
}

pub struct PoolMaintenance {
    pool: Arc<CredentialPool>,
    pools: Arc<dyn PoolStore>,
    health_every: Duration,
    refresh_every: Duration,
    refresh_window: ChronoDuration,
}

impl PoolMaintenance {
    pub fn new(
        pool: Arc<CredentialPool>,
        pools: Arc<dyn PoolStore>,
        health_every: Duration,
        refresh_every: Duration,
        refresh_window: ChronoDuration,
    ) -> Self {
        Self {
            pool,
            pools,
            health_every,
            refresh_every,
            refresh_window,
        }
    }

    pub fn from_config(
        pool: Arc<CredentialPool>,
        pools: Arc<dyn PoolStore>,
        config: &MaintenanceConfig,
    ) -> Self {
        Self::new(
            pool,
            pools,
            Duration::from_secs(config.health_check_interval_secs.max(1)),
            Duration::from_secs(config.refresh_interval_secs.max(1)),
            ChronoDuration::seconds(config.refresh_window_secs),
        )
    }

    /// Health-check every credential of every active pool.
    pub async fn health_sweep(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        let pools = match self.pools.find_active().await {
            Ok(pools) => pools,
            Err(e) => {
                tracing::warn!("Health sweep could not list pools: {}", e);
                return summary;
            }
        };

        for pool in pools {
            match self.pool.check_pool_health(&pool.id).await {
                Ok(reports) => {
                    summary.checked += reports.len();
                    summary.unhealthy += reports.iter().filter(|r| !r.is_healthy()).count();
                }
                Err(e) => tracing::warn!(pool_id = %pool.id, "Pool health check failed: {}", e),
            }
        }

        tracing::info!(
            checked = summary.checked,
            unhealthy = summary.unhealthy,
            "Credential health sweep complete"
        );
        summary
    }

    /// Refresh credentials of every active pool that expire within the window.
    pub async fn refresh_sweep(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let pools = match self.pools.find_active().await {
            Ok(pools) => pools,
            Err(e) => {
                tracing::warn!("Refresh sweep could not list pools: {}", e);
                return summary;
            }
        };

        for pool in pools {
            match self.pool.refresh_expiring(&pool.id, self.refresh_window).await {
                Ok(result) => {
                    summary.refreshed += result.refreshed;
                    summary.failed += result.failed;
                }
                Err(e) => tracing::warn!(pool_id = %pool.id, "Pool refresh sweep failed: {}", e),
            }
        }

        tracing::info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            "Credential refresh sweep complete"
        );
        summary
    }

    /// Run both sweeps on their timers until `cancel` fires. The first run of
    /// each sweep happens one full period after start.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut health = interval_at(Instant::now() + self.health_every, self.health_every);
            let mut refresh = interval_at(Instant::now() + self.refresh_every, self.refresh_every);
            health.set_missed_tick_behavior(MissedTickBehavior::Delay);
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                health_every_secs = self.health_every.as_secs(),
                refresh_every_secs = self.refresh_every.as_secs(),
                "Account pool maintenance started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = health.tick() => {
                        self.health_sweep().await;
                    }
                    _ = refresh.tick() => {
                        self.refresh_sweep().await;
                    }
                }
            }

            tracing::info!("Account pool maintenance stopped");
        })
    }
}
