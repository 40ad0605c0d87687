//! Adapter backed by a credential pool. Each call leases a credential,
//! delegates to the provider's adapter and records the outcome.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Adapter, ByteStream};
use crate::accountpool::CredentialPool;
use crate::core::error::Result;
use crate::protocol::{CanonicalRequest, CanonicalResponse};

pub struct PoolAdapter {
    pool: Arc<CredentialPool>,
    pool_id: String,
}

impl PoolAdapter {
    pub fn new(pool: Arc<CredentialPool>, pool_id: impl Into<String>) -> Self {
        Self {
            pool,
            pool_id: pool_id.into(),
        }
    }
}

#[async_trait]
impl Adapter for PoolAdapter {
    fn name(&self) -> &str {
        "account_pool"
    }

    async fn call(&self, request: &CanonicalRequest) -> Result<CanonicalResponse> {
        let lease = self.pool.acquire(&self.pool_id).await?;
        match lease.adapter.call(request).await {
            Ok(response) => {
                self.pool.record_success(&lease.credential_id);
                Ok(response)
            }
            Err(e) => {
                self.pool.record_error(&lease.credential_id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Success is recorded once the stream opens; mid-stream failures are
    /// not attributed to the credential.
    async fn call_stream(&self, request: &CanonicalRequest) -> Result<ByteStream> {
        let lease = self.pool.acquire(&self.pool_id).await?;
        match lease.adapter.call_stream(request).await {
            Ok(stream) => {
                self.pool.record_success(&lease.credential_id);
                Ok(stream)
            }
            Err(e) => {
                self.pool.record_error(&lease.credential_id, &e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountpool::kiro::KiroProvider;
    use crate::accountpool::Registry;
    use crate::core::config::KiroConfig;
    use crate::core::task_queue::BackgroundQueue;
    use crate::protocol::{Message, Role};
    use crate::store::{Credential, CredentialAuth, CredentialStore, MemoryStore};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (PoolAdapter, Arc<MemoryStore>, Arc<BackgroundQueue>) {
        let store = Arc::new(MemoryStore::new());
        let mut credential = Credential::new(
            "cred-1",
            "kiro",
            CredentialAuth::RefreshToken {
                refresh_token: "rt".to_string(),
                region: None,
            },
        );
        credential.pool_id = Some("p1".to_string());
        credential.access_token = Some("at".to_string());
        store.insert_credential(credential);

        let registry = Arc::new(Registry::new());
        registry.register(Arc::new(KiroProvider::new(
            reqwest::Client::new(),
            KiroConfig {
                api_base_url: Some(server.uri()),
                ..Default::default()
            },
        )));
        let queue = Arc::new(BackgroundQueue::new(16));
        let pool = Arc::new(CredentialPool::new(store.clone(), registry, queue.clone(), 300));
        (PoolAdapter::new(pool, "p1"), store, queue)
    }

    #[tokio::test]
    async fn test_upstream_error_is_recorded_on_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generateAssistantResponse"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let (adapter, store, queue) = setup(&server).await;
        let request = CanonicalRequest::new("claude", vec![Message::new(Role::User, "hi")]);

        let err = adapter.call(&request).await.unwrap_err();
        assert!(err.to_string().contains("403"));

        queue.shutdown().await;
        let stored = CredentialStore::find_by_id(store.as_ref(), "cred-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.request_count, 1);
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.success_count, 0);
        assert!(stored.error_message.unwrap().contains("forbidden"));
    }
}
