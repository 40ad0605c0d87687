//! In-memory implementation of every store trait.
//!
//! Keys are indexed by their SHA-256 hash so plaintext keys never sit in the map.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::RwLock;

use super::models::{AccountPool, ApiKey, Credential, LoadBalancerRule, UpstreamConfig};
use super::{ApiKeyStore, CredentialStore, LoadBalancerRuleStore, PoolStore, UpstreamStore};
use crate::api::auth::hash_key;
use crate::core::config::SeedData;
use crate::core::error::{AppError, Result};

#[derive(Default)]
pub struct MemoryStore {
    api_keys: DashMap<String, ApiKey>,
    upstreams: RwLock<Vec<UpstreamConfig>>,
    pools: DashMap<String, AccountPool>,
    credentials: DashMap<String, Credential>,
    lb_rules: DashMap<String, LoadBalancerRule>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate a store from the `seed` section of the configuration.
    pub fn from_seed(seed: &SeedData) -> Self {
        let store = Self::new();
        for key in &seed.api_keys {
            store.insert_api_key(key.clone());
        }
        for upstream in &seed.upstreams {
            store.insert_upstream(upstream.clone());
        }
        for pool in &seed.pools {
            store.insert_pool(pool.clone());
        }
        for credential in &seed.credentials {
            store.insert_credential(credential.clone());
        }
        for rule in &seed.lb_rules {
            store.insert_lb_rule(rule.clone());
        }
        store
    }

    pub fn insert_api_key(&self, key: ApiKey) {
        self.api_keys.insert(hash_key(&key.key), key);
    }

    pub fn insert_upstream(&self, upstream: UpstreamConfig) {
        let mut upstreams = self.upstreams.write().unwrap_or_else(|e| e.into_inner());
        upstreams.retain(|u| u.id != upstream.id);
        upstreams.push(upstream);
    }

    pub fn insert_pool(&self, pool: AccountPool) {
        self.pools.insert(pool.id.clone(), pool);
    }

    pub fn insert_credential(&self, credential: Credential) {
        self.credentials.insert(credential.id.clone(), credential);
    }

    pub fn insert_lb_rule(&self, rule: LoadBalancerRule) {
        self.lb_rules.insert(rule.model.clone(), rule);
    }

    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Copy of every stored credential, ordered by id.
    pub fn credentials_snapshot(&self) -> Vec<Credential> {
        let mut creds: Vec<Credential> = self.credentials.iter().map(|c| c.clone()).collect();
        creds.sort_by(|a, b| a.id.cmp(&b.id));
        creds
    }

    fn update_credential<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Credential),
    {
        let mut entry = self
            .credentials
            .get_mut(id)
            .ok_or_else(|| AppError::Storage(format!("credential {} not found", id)))?;
        f(entry.value_mut());
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>> {
        Ok(self.api_keys.get(&hash_key(key)).map(|k| k.clone()))
    }

    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut entry) = self.api_keys.iter_mut().find(|k| k.id == id) {
            entry.last_used_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamStore for MemoryStore {
    async fn find_active_by_model(&self, model: &str) -> Result<Vec<UpstreamConfig>> {
        let upstreams = self.upstreams.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<UpstreamConfig> = upstreams
            .iter()
            .filter(|u| u.is_active && u.supports_model(model))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.weight.cmp(&a.weight))
        });
        Ok(matched)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<UpstreamConfig>> {
        let upstreams = self.upstreams.read().unwrap_or_else(|e| e.into_inner());
        Ok(upstreams.iter().find(|u| u.id == id).cloned())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_pool(&self, pool_id: &str) -> Result<Vec<Credential>> {
        let mut creds: Vec<Credential> = self
            .credentials
            .iter()
            .filter(|c| c.pool_id.as_deref() == Some(pool_id))
            .map(|c| c.clone())
            .collect();
        creds.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(creds)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Credential>> {
        Ok(self.credentials.get(id).map(|c| c.clone()))
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        if !self.credentials.contains_key(&credential.id) {
            return Err(AppError::Storage(format!(
                "credential {} not found",
                credential.id
            )));
        }
        self.credentials
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn create(&self, mut credential: Credential) -> Result<Credential> {
        if credential.id.is_empty() {
            credential.id = uuid::Uuid::new_v4().to_string();
        }
        if self.credentials.contains_key(&credential.id) {
            return Err(AppError::Storage(format!(
                "credential {} already exists",
                credential.id
            )));
        }
        self.credentials
            .insert(credential.id.clone(), credential.clone());
        Ok(credential)
    }

    async fn record_usage(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_credential(id, |c| {
            c.request_count += 1;
            c.last_used_at = Some(at);
        })
    }

    async fn record_success(&self, id: &str) -> Result<()> {
        self.update_credential(id, |c| c.success_count += 1)
    }

    async fn record_error(&self, id: &str, message: &str) -> Result<()> {
        self.update_credential(id, |c| {
            c.error_count += 1;
            c.error_message = Some(message.to_string());
        })
    }

    async fn mark_unhealthy(&self, id: &str, message: &str) -> Result<()> {
        self.update_credential(id, |c| {
            c.is_active = false;
            c.error_message = Some(message.to_string());
        })
    }

    async fn record_health_check(
        &self,
        id: &str,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()> {
        self.update_credential(id, |c| {
            c.last_check_at = Some(at);
            if error.is_some() {
                c.error_message = error;
            }
        })
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<AccountPool>> {
        Ok(self.pools.get(id).map(|p| p.clone()))
    }

    async fn find_active(&self) -> Result<Vec<AccountPool>> {
        let mut pools: Vec<AccountPool> = self
            .pools
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.clone())
            .collect();
        pools.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pools)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.pools.remove(id).is_some())
    }
}

#[async_trait]
impl LoadBalancerRuleStore for MemoryStore {
    async fn find_active_by_model(&self, model: &str) -> Result<Option<LoadBalancerRule>> {
        Ok(self
            .lb_rules
            .get(model)
            .filter(|r| r.is_active)
            .map(|r| r.clone()))
    }
}
