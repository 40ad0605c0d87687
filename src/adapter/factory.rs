//! Builds the adapter for an upstream config from its `kind`.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::anthropic::AnthropicAdapter;
use super::gemini::GeminiAdapter;
use super::openai::OpenAiAdapter;
use super::pooled::PoolAdapter;
use super::{build_http_client, Adapter};
use crate::accountpool::CredentialPool;
use crate::core::error::{AppError, Result};
use crate::store::{UpstreamConfig, UpstreamKind};

pub struct AdapterFactory {
    verify_ssl: bool,
    default_timeout_secs: u64,
    /// One client per connect timeout so connection pools are shared between configs
    clients: DashMap<u64, reqwest::Client>,
    pool: Option<Arc<CredentialPool>>,
}

impl AdapterFactory {
    pub fn new(verify_ssl: bool, default_timeout_secs: u64) -> Self {
        Self {
            verify_ssl,
            default_timeout_secs,
            clients: DashMap::new(),
            pool: None,
        }
    }

    /// Enable `account_pool:*` configs.
    pub fn with_pool(mut self, pool: Arc<CredentialPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    fn timeout_secs(&self, configured: u64) -> u64 {
        if configured > 0 {
            configured
        } else {
            self.default_timeout_secs
        }
    }

    fn client(&self, timeout: u64) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(&timeout) {
            return Ok(client.clone());
        }
        let client = build_http_client(timeout, self.verify_ssl)?;
        self.clients.insert(timeout, client.clone());
        Ok(client)
    }

    pub fn create(&self, config: &UpstreamConfig) -> Result<Arc<dyn Adapter>> {
        let secs = self.timeout_secs(config.timeout_secs);
        let timeout = Duration::from_secs(secs);
        let adapter: Arc<dyn Adapter> = match config.upstream_kind() {
            UpstreamKind::OpenAi | UpstreamKind::Custom => Arc::new(
                OpenAiAdapter::new(self.client(secs)?, &config.base_url, config.api_key.clone())
                    .with_timeout(timeout),
            ),
            UpstreamKind::Anthropic => Arc::new(
                AnthropicAdapter::new(self.client(secs)?, &config.base_url, config.api_key.clone())
                    .with_timeout(timeout),
            ),
            UpstreamKind::Gemini => Arc::new(
                GeminiAdapter::new(self.client(secs)?, &config.base_url, config.api_key.clone())
                    .with_timeout(timeout),
            ),
            UpstreamKind::AccountPool { provider, pool_id } => {
                let pool = self.pool.as_ref().ok_or_else(|| {
                    AppError::AdapterCreation("account pools are not enabled".to_string())
                })?;
                pool.registry().get(&provider)?;
                Arc::new(PoolAdapter::new(pool.clone(), pool_id))
            }
            UpstreamKind::Unknown(kind) => {
                return Err(AppError::AdapterCreation(format!(
                    "unsupported provider type: {}",
                    kind
                )))
            }
        };

        tracing::debug!(
            config_id = %config.id,
            adapter = adapter.name(),
            "Adapter created"
        );
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountpool::kiro::KiroProvider;
    use crate::accountpool::Registry;
    use crate::core::config::KiroConfig;
    use crate::core::task_queue::BackgroundQueue;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    fn config(kind: &str) -> UpstreamConfig {
        UpstreamConfig {
            id: "cfg".to_string(),
            kind: kind.to_string(),
            base_url: "https://upstream.example".to_string(),
            api_key: "k".to_string(),
            models: vec!["m".to_string()],
            priority: 0,
            weight: 1,
            is_active: true,
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_static_kinds() {
        let factory = AdapterFactory::new(true, 60);
        assert_eq!(factory.create(&config("openai")).unwrap().name(), "openai");
        assert_eq!(factory.create(&config("custom")).unwrap().name(), "openai");
        assert_eq!(factory.create(&config("anthropic")).unwrap().name(), "anthropic");
        assert_eq!(factory.create(&config("gemini")).unwrap().name(), "gemini");
        assert_eq!(factory.clients.len(), 1);
    }

    #[test]
    fn test_unknown_kind_fails() {
        let factory = AdapterFactory::new(true, 60);
        let err = factory.create(&config("bedrock")).err().unwrap();
        assert_eq!(
            err.to_string(),
            "failed to create adapter: unsupported provider type: bedrock"
        );
    }

    #[tokio::test]
    async fn test_account_pool_kind() {
        let factory = AdapterFactory::new(true, 60);
        assert!(matches!(
            factory.create(&config("account_pool:kiro:p1")),
            Err(AppError::AdapterCreation(_))
        ));

        let registry = Arc::new(Registry::new());
        registry.register(Arc::new(KiroProvider::new(
            reqwest::Client::new(),
            KiroConfig::default(),
        )));
        let pool = Arc::new(CredentialPool::new(
            Arc::new(MemoryStore::new()),
            registry,
            Arc::new(BackgroundQueue::new(4)),
            300,
        ));
        let factory = AdapterFactory::new(true, 60).with_pool(pool);

        assert_eq!(
            factory.create(&config("account_pool:kiro:p1")).unwrap().name(),
            "account_pool"
        );
        assert!(matches!(
            factory.create(&config("account_pool:ghost:p1")),
            Err(AppError::ProviderNotFound(_))
        ));
    }
}
