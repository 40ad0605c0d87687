//! Wiring: builds every component from a [`GatewayConfig`].

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

use crate::accountpool::kiro::KiroProvider;
use crate::accountpool::{CredentialPool, DeviceCodeSessions, PoolMaintenance, Registry};
use crate::adapter::{build_http_client, AdapterFactory};
use crate::api::{self, AppState};
use crate::core::config::GatewayConfig;
use crate::core::error::Result;
use crate::core::request_logger::{RequestLogSink, TracingRequestLog};
use crate::core::task_queue::BackgroundQueue;
use crate::protocol::CodecRegistry;
use crate::services::{Collaborators, GatewayOrchestrator, InMemoryPricing, InMemoryQuota};
use crate::store::MemoryStore;

/// A fully wired gateway. Must be built inside a tokio runtime.
pub struct Gateway {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub quota: Arc<InMemoryQuota>,
    pub queue: Arc<BackgroundQueue>,
    maintenance: Arc<PoolMaintenance>,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    request_timeout: Duration,
}

impl Gateway {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        Self::with_request_log(config, Arc::new(TracingRequestLog))
    }

    pub fn with_request_log(
        config: &GatewayConfig,
        request_log: Arc<dyn RequestLogSink>,
    ) -> Result<Self> {
        let store = Arc::new(MemoryStore::from_seed(&config.seed));
        let quota = Arc::new(InMemoryQuota::from_users(&config.seed.users));
        let pricing = Arc::new(InMemoryPricing::new(config.seed.pricing.clone()));
        let queue = Arc::new(BackgroundQueue::new(config.background_queue_capacity));

        let http_client = build_http_client(config.request_timeout_secs, config.verify_ssl)?;
        let registry = Arc::new(Registry::new());
        registry.register(Arc::new(
            KiroProvider::new(http_client, config.kiro.clone())
                .with_timeout(Duration::from_secs(config.request_timeout_secs)),
        ));

        let pool = Arc::new(CredentialPool::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            config.credential_refresh_horizon_secs,
        ));
        let maintenance = Arc::new(PoolMaintenance::from_config(
            pool.clone(),
            store.clone(),
            &config.maintenance,
        ));
        let adapters = Arc::new(
            AdapterFactory::new(config.verify_ssl, config.request_timeout_secs)
                .with_pool(pool.clone()),
        );

        let orchestrator = Arc::new(GatewayOrchestrator::new(Collaborators {
            api_keys: store.clone(),
            upstreams: store.clone(),
            lb_rules: store.clone(),
            quota: quota.clone(),
            pricing,
            request_log,
            adapters,
            queue: queue.clone(),
        }));

        let sessions = DeviceCodeSessions::new(
            registry.clone(),
            store.clone(),
            store.clone(),
            config.device_code.clone(),
        );

        tracing::info!(
            upstreams = config.seed.upstreams.len(),
            pools = config.seed.pools.len(),
            credentials = config.seed.credentials.len(),
            providers = ?registry.list(),
            "Gateway initialized"
        );

        Ok(Self {
            state: Arc::new(AppState {
                orchestrator,
                codecs: Arc::new(CodecRegistry::new()),
                sessions,
                registry,
                pool,
            }),
            store,
            quota,
            queue,
            maintenance,
            maintenance_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Router with a timeout on time-to-response-headers.
    pub fn router(&self) -> Router {
        api::router(self.state.clone()).layer(TimeoutLayer::new(self.request_timeout))
    }

    /// Start the periodic pool sweeps. A second call is a no-op.
    pub async fn start_maintenance(&self) {
        let mut task = self.maintenance_task.lock().await;
        if task.is_none() {
            *task = Some(self.maintenance.clone().spawn(self.cancel.clone()));
        }
    }

    /// Stop pool maintenance, then drain queued background work.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.maintenance_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Pool maintenance task ended abnormally: {}", e);
            }
        }
        self.queue.shutdown().await;
    }
}
