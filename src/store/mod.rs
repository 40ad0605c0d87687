//! Storage collaborators.
//!
//! The core only talks to these traits. [`memory::MemoryStore`] implements all
//! of them so the gateway runs without an external database.

pub mod memory;
pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::error::Result;

pub use memory::MemoryStore;
pub use models::{
    AccountPool, ApiKey, Credential, CredentialAuth, LoadBalancerRule, Pricing, UpstreamConfig,
    UpstreamKind, User,
};

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Look up a key by its plaintext value.
    async fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>>;

    async fn touch_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait UpstreamStore: Send + Sync {
    /// Active configs that advertise `model`, in priority order.
    async fn find_active_by_model(&self, model: &str) -> Result<Vec<UpstreamConfig>>;

    async fn find_by_id(&self, id: &str) -> Result<Option<UpstreamConfig>>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_pool(&self, pool_id: &str) -> Result<Vec<Credential>>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Credential>>;

    /// Overwrite an existing credential.
    async fn save(&self, credential: &Credential) -> Result<()>;

    async fn create(&self, credential: Credential) -> Result<Credential>;

    async fn record_usage(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn record_success(&self, id: &str) -> Result<()>;

    async fn record_error(&self, id: &str, message: &str) -> Result<()>;

    /// Deactivate a credential and keep the reason. There is no reactivation path.
    async fn mark_unhealthy(&self, id: &str, message: &str) -> Result<()>;

    async fn record_health_check(
        &self,
        id: &str,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()>;
}

#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<AccountPool>>;

    /// Active pools, ordered by id.
    async fn find_active(&self) -> Result<Vec<AccountPool>>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait LoadBalancerRuleStore: Send + Sync {
    async fn find_active_by_model(&self, model: &str) -> Result<Option<LoadBalancerRule>>;
}
