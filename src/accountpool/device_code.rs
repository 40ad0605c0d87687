//! OAuth device-code sessions.
//!
//! Starting a session registers it under its `device_code` and spawns a
//! cancellable poll task. The task sleeps one interval, exchanges the device
//! code, and repeats until the provider grants a token, refuses, or the code
//! expires. A granted token becomes a new `BuilderId` credential in the
//! session's pool.
//!
//! ```text
//! Initiated -> AwaitingUser -> Approved | Denied | Expired | Cancelled | Failed
//! ```
//!
//! Whoever removes the session entry first (the poll task, a manual poll or
//! a cancel) owns the terminal transition, so at most one credential is
//! persisted per session. Terminal outcomes stay queryable for
//! `outcome_ttl_secs` and are pruned after that.
//!
//! Polling stops once the scheduled waits add up to `expires_in`. A
//! `slow_down` answer lengthens every later wait, so it also spends the
//! budget faster.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::provider::{DeviceAuthorization, Registry, TokenGrant, TokenPoll};
use crate::core::config::DeviceCodeConfig;
use crate::core::error::{AppError, Result};
use crate::store::{Credential, CredentialAuth, CredentialStore, PoolStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initiated,
    AwaitingUser,
    Approved,
    Denied,
    Expired,
    Cancelled,
    /// Approved, but the credential could not be stored
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Initiated | SessionState::AwaitingUser)
    }
}

/// Live session. Holds the client secret, so it is dropped as soon as the
/// session reaches a terminal state.
#[derive(Debug, Clone)]
pub struct DeviceCodeSession {
    pub authorization: DeviceAuthorization,
    pub pool_id: String,
    pub provider: String,
    pub state: SessionState,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct DeviceCodeSessions {
    registry: Arc<Registry>,
    credentials: Arc<dyn CredentialStore>,
    pools: Arc<dyn PoolStore>,
    config: DeviceCodeConfig,
    sessions: Arc<DashMap<String, DeviceCodeSession>>,
    outcomes: Arc<DashMap<String, (SessionState, Instant)>>,
}

impl DeviceCodeSessions {
    pub fn new(
        registry: Arc<Registry>,
        credentials: Arc<dyn CredentialStore>,
        pools: Arc<dyn PoolStore>,
        config: DeviceCodeConfig,
    ) -> Self {
        Self {
            registry,
            credentials,
            pools,
            config,
            sessions: Arc::new(DashMap::new()),
            outcomes: Arc::new(DashMap::new()),
        }
    }

    /// Begin a device-code login for `pool_id` and start polling in the
    /// background. Returns as soon as the provider issued a code.
    pub async fn start(&self, pool_id: &str, provider_name: &str) -> Result<DeviceAuthorization> {
        let pool = self
            .pools
            .find_by_id(pool_id)
            .await?
            .ok_or_else(|| AppError::PoolNotFound(pool_id.to_string()))?;
        if pool.provider != provider_name {
            return Err(AppError::malformed(
                "provider",
                format!(
                    "provider {} does not match pool provider {}",
                    provider_name, pool.provider
                ),
            ));
        }

        let provider = self.registry.get(provider_name)?;
        let device = provider
            .as_device_code()
            .ok_or_else(|| AppError::DeviceFlowUnsupported(provider_name.to_string()))?;
        let authorization = device.initiate_device_code().await?;

        let token = CancellationToken::new();
        self.sessions.insert(
            authorization.device_code.clone(),
            DeviceCodeSession {
                authorization: authorization.clone(),
                pool_id: pool_id.to_string(),
                provider: provider_name.to_string(),
                state: SessionState::Initiated,
                cancel: token.clone(),
            },
        );

        tracing::info!(
            pool_id = %pool_id,
            provider = %provider_name,
            user_code = %authorization.user_code,
            "Device code session started"
        );

        let this = self.clone();
        let device_code = authorization.device_code.clone();
        tokio::spawn(async move { this.run_poll(device_code, token).await });

        Ok(authorization)
    }

    async fn run_poll(self, device_code: String, token: CancellationToken) {
        let Some((interval, expires_in)) = self.sessions.get_mut(&device_code).map(|mut s| {
            s.state = SessionState::AwaitingUser;
            (s.authorization.interval.max(1), s.authorization.expires_in)
        }) else {
            return;
        };

        let unit = Duration::from_millis(self.config.poll_unit_ms);
        let budget = unit.saturating_mul(u32::try_from(expires_in.max(interval)).unwrap_or(u32::MAX));
        let mut wait = unit.saturating_mul(u32::try_from(interval).unwrap_or(u32::MAX));
        let mut scheduled = Duration::ZERO;
        let mut attempt = 0u64;

        loop {
            scheduled = scheduled.saturating_add(wait);
            if scheduled > budget {
                break;
            }
            attempt += 1;

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(device_code = %device_code, "Device code poll cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.exchange(&device_code).await {
                Ok(TokenPoll::Pending) => {
                    tracing::debug!(attempt, "Device authorization pending");
                }
                Ok(TokenPoll::SlowDown) => {
                    wait += unit.saturating_mul(
                        u32::try_from(self.config.slow_down_backoff_secs).unwrap_or(u32::MAX),
                    );
                    tracing::debug!(attempt, wait_ms = wait.as_millis() as u64, "Device poll slowed down");
                }
                Ok(TokenPoll::Granted(grant)) => {
                    if let Err(e) = self.complete(&device_code, grant).await {
                        tracing::error!(device_code = %device_code, "Device login approved but not stored: {}", e);
                    }
                    return;
                }
                Ok(TokenPoll::Failed(reason)) => {
                    tracing::warn!(device_code = %device_code, "Device authorization failed: {}", reason);
                    self.finish(&device_code, SessionState::Denied);
                    return;
                }
                Err(AppError::SessionNotFound(_)) => return,
                Err(e) => {
                    tracing::warn!(attempt, "Device token exchange error, retrying: {}", e);
                }
            }
        }

        tracing::info!(device_code = %device_code, attempts = attempt, "Device code expired");
        self.finish(&device_code, SessionState::Expired);
    }

    async fn exchange(&self, device_code: &str) -> Result<TokenPoll> {
        let (authorization, provider_name) = self
            .sessions
            .get(device_code)
            .map(|s| (s.authorization.clone(), s.provider.clone()))
            .ok_or_else(|| AppError::SessionNotFound(device_code.to_string()))?;

        let provider = self.registry.get(&provider_name)?;
        let device = provider
            .as_device_code()
            .ok_or_else(|| AppError::DeviceFlowUnsupported(provider_name.clone()))?;
        device.exchange_device_code(&authorization).await
    }

    /// Remove the session and record its outcome. Returns the removed
    /// session only to the first caller.
    fn finish(&self, device_code: &str, state: SessionState) -> Option<DeviceCodeSession> {
        let (_, session) = self.sessions.remove(device_code)?;
        self.prune_outcomes();
        self.record_outcome(device_code, state);
        Some(session)
    }

    fn record_outcome(&self, device_code: &str, state: SessionState) {
        self.outcomes
            .insert(device_code.to_string(), (state, Instant::now()));
    }

    /// Drop outcomes older than `outcome_ttl_secs`.
    fn prune_outcomes(&self) {
        let ttl = Duration::from_secs(self.config.outcome_ttl_secs);
        self.outcomes.retain(|_, (_, at)| at.elapsed() < ttl);
    }

    async fn complete(&self, device_code: &str, grant: TokenGrant) -> Result<Option<Credential>> {
        let Some(session) = self.finish(device_code, SessionState::Approved) else {
            return Ok(None);
        };

        if self.pools.find_by_id(&session.pool_id).await?.is_none() {
            tracing::warn!(pool_id = %session.pool_id, "Pool deleted during device login, discarding token");
            self.record_outcome(device_code, SessionState::Cancelled);
            return Ok(None);
        }

        let now = Utc::now();
        let auth = session.authorization;
        let mut credential = Credential::new(
            String::new(),
            session.provider,
            CredentialAuth::BuilderId {
                client_id: auth.client_id,
                client_secret: auth.client_secret,
                refresh_token: grant.refresh_token,
                idc_region: Some(auth.region),
            },
        );
        credential.pool_id = Some(session.pool_id);
        credential.name = format!("Kiro Builder ID - {}", now.format("%Y-%m-%d %H:%M"));
        credential.access_token = Some(grant.access_token);
        credential.expires_at = Some(now + ChronoDuration::seconds(grant.expires_in));

        let created = match self.credentials.create(credential).await {
            Ok(created) => created,
            Err(e) => {
                self.record_outcome(device_code, SessionState::Failed);
                return Err(e);
            }
        };
        tracing::info!(
            credential_id = %created.id,
            pool_id = ?created.pool_id,
            "Device login approved, credential stored"
        );
        Ok(Some(created))
    }

    /// One manual token exchange for a live session.
    pub async fn poll_once(&self, device_code: &str) -> Result<Credential> {
        match self.exchange(device_code).await? {
            TokenPoll::Pending | TokenPoll::SlowDown => Err(AppError::AuthorizationPending),
            TokenPoll::Granted(grant) => self
                .complete(device_code, grant)
                .await?
                .ok_or_else(|| AppError::SessionNotFound(device_code.to_string())),
            TokenPoll::Failed(reason) => {
                self.finish(device_code, SessionState::Denied);
                Err(AppError::ApiCallFailed(format!(
                    "device authorization failed: {}",
                    reason
                )))
            }
        }
    }

    /// Stop polling `device_code`. Returns false if no live session exists.
    pub fn cancel(&self, device_code: &str) -> bool {
        match self.finish(device_code, SessionState::Cancelled) {
            Some(session) => {
                session.cancel.cancel();
                tracing::info!(device_code = %device_code, "Device code session cancelled");
                true
            }
            None => false,
        }
    }

    /// Stop every poll targeting `pool_id`. Returns how many were cancelled.
    pub fn cancel_pool(&self, pool_id: &str) -> usize {
        let codes: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.pool_id == pool_id)
            .map(|s| s.key().clone())
            .collect();
        codes.iter().filter(|code| self.cancel(code)).count()
    }

    /// Delete a pool and stop its pending logins.
    pub async fn remove_pool(&self, pool_id: &str) -> Result<bool> {
        let cancelled = self.cancel_pool(pool_id);
        if cancelled > 0 {
            tracing::info!(pool_id = %pool_id, cancelled, "Cancelled device logins for deleted pool");
        }
        self.pools.delete(pool_id).await
    }

    pub fn status(&self, device_code: &str) -> Option<SessionState> {
        if let Some(session) = self.sessions.get(device_code) {
            return Some(session.state);
        }
        let ttl = Duration::from_secs(self.config.outcome_ttl_secs);
        self.outcomes
            .get(device_code)
            .filter(|entry| entry.1.elapsed() < ttl)
            .map(|entry| entry.0)
    }

    /// Number of sessions still polling.
    pub fn active(&self) -> usize {
        self.sessions.len()
    }
}
