//! Credential selection, background refresh and outcome recording.
//!
//! The pool never blocks a request on a refresh: a credential close to
//! expiry is still handed out while a detached task refreshes it. A failed
//! refresh deactivates the credential for later selections.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::provider::{Provider, Registry};
use crate::adapter::Adapter;
use crate::core::error::{AppError, Result};
use crate::core::metrics::get_metrics;
use crate::core::task_queue::BackgroundQueue;
use crate::store::{Credential, CredentialStore};

/// A credential handed out for one upstream call.
pub struct Lease {
    pub adapter: Arc<dyn Adapter>,
    pub credential_id: String,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("adapter", &self.adapter.name())
            .field("credential_id", &self.credential_id)
            .finish()
    }
}

/// Outcome of one credential health check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub credential_id: String,
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

pub struct CredentialPool {
    credentials: Arc<dyn CredentialStore>,
    registry: Arc<Registry>,
    queue: Arc<BackgroundQueue>,
    counters: DashMap<String, AtomicUsize>,
    refresh_horizon: Duration,
}

impl CredentialPool {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        registry: Arc<Registry>,
        queue: Arc<BackgroundQueue>,
        refresh_horizon_secs: i64,
    ) -> Self {
        Self {
            credentials,
            registry,
            queue,
            counters: DashMap::new(),
            refresh_horizon: Duration::seconds(refresh_horizon_secs),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Pick a selectable credential from `pool_id` and build its adapter.
    pub async fn acquire(&self, pool_id: &str) -> Result<Lease> {
        let now = Utc::now();
        let healthy: Vec<Credential> = self
            .credentials
            .find_by_pool(pool_id)
            .await?
            .into_iter()
            .filter(|c| c.is_selectable(now))
            .collect();

        if healthy.is_empty() {
            tracing::warn!(pool_id = %pool_id, "No healthy credential in pool");
            return Err(AppError::NoHealthyCredential);
        }

        let index = self.next_index(pool_id) % healthy.len();
        let credential = &healthy[index];
        let provider = self.registry.get(&credential.provider)?;

        if credential.expires_within(now, self.refresh_horizon) {
            self.spawn_refresh(provider.clone(), credential.clone());
        }

        let adapter = match provider.create_adapter(credential) {
            Ok(adapter) => adapter,
            Err(e) => {
                let cause = match e {
                    AppError::AdapterCreation(cause) => cause,
                    other => other.to_string(),
                };
                tracing::error!(
                    credential_id = %credential.id,
                    pool_id = %pool_id,
                    "Adapter creation failed, deactivating credential: {}",
                    cause
                );
                if let Err(e) = self.credentials.mark_unhealthy(&credential.id, &cause).await {
                    tracing::warn!(credential_id = %credential.id, "Failed to mark credential unhealthy: {}", e);
                }
                return Err(AppError::AdapterCreation(cause));
            }
        };

        let store = self.credentials.clone();
        let id = credential.id.clone();
        self.queue.submit("credential_usage", async move {
            store.record_usage(&id, now).await
        });

        tracing::debug!(
            credential_id = %credential.id,
            pool_id = %pool_id,
            provider = provider.name(),
            "Credential acquired"
        );

        Ok(Lease {
            adapter,
            credential_id: credential.id.clone(),
        })
    }

    fn next_index(&self, pool_id: &str) -> usize {
        if let Some(counter) = self.counters.get(pool_id) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(pool_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Refresh detached from the request.
    fn spawn_refresh(&self, provider: Arc<dyn Provider>, credential: Credential) {
        let store = self.credentials.clone();
        tokio::spawn(async move {
            refresh_credential(store.as_ref(), provider.as_ref(), credential).await;
        });
    }

    /// Refresh, in place, every active credential of `pool_id` that expires
    /// within `window` or has no known expiry.
    pub async fn refresh_expiring(&self, pool_id: &str, window: Duration) -> Result<RefreshSummary> {
        let now = Utc::now();
        let due: Vec<Credential> = self
            .credentials
            .find_by_pool(pool_id)
            .await?
            .into_iter()
            .filter(|c| c.is_active)
            .filter(|c| c.expires_at.is_none() || c.expires_within(now, window))
            .collect();

        let mut summary = RefreshSummary::default();
        for credential in due {
            let provider = match self.registry.get(&credential.provider) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::debug!(credential_id = %credential.id, "Skipping refresh: {}", e);
                    continue;
                }
            };
            if refresh_credential(self.credentials.as_ref(), provider.as_ref(), credential).await {
                summary.refreshed += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    pub fn record_success(&self, credential_id: &str) {
        let store = self.credentials.clone();
        let id = credential_id.to_string();
        self.queue.submit("credential_success", async move {
            store.record_success(&id).await
        });
    }

    pub fn record_error(&self, credential_id: &str, message: &str) {
        let store = self.credentials.clone();
        let id = credential_id.to_string();
        let message = message.to_string();
        self.queue.submit("credential_error", async move {
            store.record_error(&id, &message).await
        });
    }

    /// Check every active credential in the pool and stamp `last_check_at`.
    /// Failures are recorded but do not deactivate anything.
    pub async fn check_pool_health(&self, pool_id: &str) -> Result<Vec<HealthReport>> {
        let credentials = self.credentials.find_by_pool(pool_id).await?;
        let mut reports = Vec::with_capacity(credentials.len());

        for credential in credentials.iter().filter(|c| c.is_active) {
            let verdict = match self.registry.get(&credential.provider) {
                Ok(provider) => provider.check_health(credential).await,
                Err(e) => Err(e),
            };
            let error = verdict.err().map(|e| e.to_string());
            if let Some(message) = &error {
                tracing::warn!(credential_id = %credential.id, "Credential health check failed: {}", message);
            }
            self.credentials
                .record_health_check(&credential.id, Utc::now(), error.clone())
                .await?;
            reports.push(HealthReport {
                credential_id: credential.id.clone(),
                error,
            });
        }
        Ok(reports)
    }
}

/// Counts from one [`CredentialPool::refresh_expiring`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
}

/// Refresh one credential and store the outcome. A success is merged into
/// the stored record so counters updated meanwhile are kept; a failure
/// deactivates the credential. Returns true on success.
async fn refresh_credential(
    store: &dyn CredentialStore,
    provider: &dyn Provider,
    mut credential: Credential,
) -> bool {
    let provider_name = provider.name().to_string();
    match provider.refresh_token(&mut credential).await {
        Ok(()) => {
            get_metrics()
                .credential_refresh_total
                .with_label_values(&[&provider_name, "success"])
                .inc();
            if let Err(e) = persist_refresh(store, &credential).await {
                tracing::warn!(credential_id = %credential.id, "Failed to persist refreshed token: {}", e);
            }
            true
        }
        Err(e) => {
            get_metrics()
                .credential_refresh_total
                .with_label_values(&[&provider_name, "failure"])
                .inc();
            tracing::warn!(
                credential_id = %credential.id,
                provider = %provider_name,
                "Token refresh failed, deactivating credential: {}",
                e
            );
            if let Err(e) = store.mark_unhealthy(&credential.id, &e.to_string()).await {
                tracing::warn!(credential_id = %credential.id, "Failed to mark credential unhealthy: {}", e);
            }
            false
        }
    }
}

async fn persist_refresh(store: &dyn CredentialStore, refreshed: &Credential) -> Result<()> {
    let mut current = store
        .find_by_id(&refreshed.id)
        .await?
        .ok_or_else(|| AppError::Storage(format!("credential {} not found", refreshed.id)))?;
    current.access_token = refreshed.access_token.clone();
    current.auth = refreshed.auth.clone();
    current.profile_arn = refreshed.profile_arn.clone();
    current.expires_at = refreshed.expires_at;
    current.daily_used = refreshed.daily_used;
    current.quota_reset_at = refreshed.quota_reset_at;
    store.save(&current).await
}
