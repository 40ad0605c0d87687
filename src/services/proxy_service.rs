//! Request pipeline shared by every client protocol.
//!
//! ```text
//! authenticate -> quota pre-check -> candidates -> balancer -> adapter -> settle -> log
//! ```
//!
//! Every step either continues or ends the request with an [`AppError`].
//! Request logs, key touches and credential counters go through the
//! [`BackgroundQueue`] so the response never waits on them.

use chrono::Utc;
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Instant;

use crate::adapter::{AdapterFactory, ByteStream};
use crate::core::error::{AppError, Result};
use crate::core::error_types::{LOG_MESSAGE_INSUFFICIENT_QUOTA, LOG_MESSAGE_NO_CONFIG};
use crate::core::logging::get_request_id;
use crate::core::metrics::get_metrics;
use crate::core::request_logger::{RequestLogRecord, RequestLogSink};
use crate::core::task_queue::BackgroundQueue;
use crate::protocol::{CanonicalRequest, CanonicalResponse, Protocol};
use crate::services::load_balancer::{ConnectionGuard, LoadBalancerFactory, Strategy};
use crate::services::pricing::{credits_from_micro, PricingService};
use crate::services::quota::QuotaService;
use crate::store::{ApiKeyStore, LoadBalancerRuleStore, UpstreamConfig, UpstreamStore};

/// Flat per-message overhead used by the input estimate.
const MESSAGE_OVERHEAD_CHARS: i64 = 10;
const TOOL_OVERHEAD_CHARS: i64 = 150;
const CHARS_PER_TOKEN: i64 = 3;
const MIN_INPUT_ESTIMATE: i64 = 10;
const MIN_OUTPUT_ESTIMATE: i64 = 100;
const MAX_OUTPUT_ESTIMATE: i64 = 2000;

/// The authenticated caller of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    pub user_id: String,
    pub api_key_id: String,
}

/// Transport details copied into request logs and metrics.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub protocol: Protocol,
    pub method: String,
    pub path: String,
}

impl RequestMeta {
    pub fn post(protocol: Protocol, path: impl Into<String>) -> Self {
        Self {
            protocol,
            method: "POST".to_string(),
            path: path.into(),
        }
    }
}

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub upstreams: Arc<dyn UpstreamStore>,
    pub lb_rules: Arc<dyn LoadBalancerRuleStore>,
    pub quota: Arc<dyn QuotaService>,
    pub pricing: Arc<dyn PricingService>,
    pub request_log: Arc<dyn RequestLogSink>,
    pub adapters: Arc<AdapterFactory>,
    pub queue: Arc<BackgroundQueue>,
}

/// Upstream chosen for one call, with the balancer slot it occupies.
struct RoutingDecision {
    config: UpstreamConfig,
    guard: ConnectionGuard,
}

pub struct GatewayOrchestrator {
    deps: Collaborators,
    balancers: LoadBalancerFactory,
}

/// Input token estimate: `Σ(len + 10) + 150 per tool`, over 3, at least 10.
pub fn estimate_input_tokens(request: &CanonicalRequest) -> i64 {
    let chars: i64 = request
        .messages
        .iter()
        .map(|m| m.content.len() as i64 + MESSAGE_OVERHEAD_CHARS)
        .sum::<i64>()
        + request.tools.len() as i64 * TOOL_OVERHEAD_CHARS;
    (chars / CHARS_PER_TOKEN).max(MIN_INPUT_ESTIMATE)
}

/// Output token estimate: `max_tokens` when given, else half the input
/// clamped to `[100, 2000]`.
pub fn estimate_output_tokens(request: &CanonicalRequest, input_estimate: i64) -> i64 {
    match request.max_tokens {
        Some(max) if max > 0 => max as i64,
        _ => (input_estimate / 2).clamp(MIN_OUTPUT_ESTIMATE, MAX_OUTPUT_ESTIMATE),
    }
}

/// Keep upstream causes as they are; wrap everything else once.
fn upstream_failure(err: AppError) -> AppError {
    match err {
        AppError::ApiCallFailed(_) => err,
        other => AppError::ApiCallFailed(other.to_string()),
    }
}

impl GatewayOrchestrator {
    pub fn new(deps: Collaborators) -> Self {
        Self {
            deps,
            balancers: LoadBalancerFactory::new(),
        }
    }

    pub fn balancers(&self) -> &LoadBalancerFactory {
        &self.balancers
    }

    /// Resolve the caller's key. Missing, unknown and inactive keys are all
    /// [`AppError::InvalidApiKey`].
    pub async fn authenticate(&self, key: Option<&str>) -> Result<Caller> {
        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(AppError::InvalidApiKey)?;

        let api_key = self
            .deps
            .api_keys
            .find_by_key(key)
            .await?
            .filter(|k| k.is_active)
            .ok_or_else(|| {
                tracing::warn!("Rejected request with invalid API key");
                AppError::InvalidApiKey
            })?;

        let store = self.deps.api_keys.clone();
        let id = api_key.id.clone();
        self.deps.queue.submit("touch_api_key", async move {
            store.touch_last_used(&id, Utc::now()).await
        });

        Ok(Caller {
            user_id: api_key.user_id,
            api_key_id: api_key.id,
        })
    }

    /// Buffered call.
    pub async fn complete(
        &self,
        key: Option<&str>,
        request: CanonicalRequest,
        meta: &RequestMeta,
    ) -> Result<CanonicalResponse> {
        let model = request.model.clone();
        let result = self.complete_inner(key, request, meta).await;
        self.count(meta, &model, &result);
        result
    }

    /// Streaming call. The returned stream holds the balancer slot until it
    /// is dropped.
    pub async fn stream(
        &self,
        key: Option<&str>,
        request: CanonicalRequest,
        meta: &RequestMeta,
    ) -> Result<ByteStream> {
        let model = request.model.clone();
        let result = self.stream_inner(key, request, meta).await;
        self.count(meta, &model, &result);
        result
    }

    async fn complete_inner(
        &self,
        key: Option<&str>,
        request: CanonicalRequest,
        meta: &RequestMeta,
    ) -> Result<CanonicalResponse> {
        let started = Instant::now();
        let caller = self.authenticate(key).await?;

        let input = estimate_input_tokens(&request);
        let output = estimate_output_tokens(&request, input);
        self.precheck_quota(&caller, &request, meta, input + output, started)
            .await?;

        let route = self.route(&caller, &request, meta, started).await?;
        let upstream_id = route.config.id.clone();

        let adapter = self
            .deps
            .adapters
            .create(&route.config)
            .map_err(|e| self.dispatch_failed(&caller, &request, meta, &upstream_id, e, started))?;

        let call_started = Instant::now();
        let result = adapter.call(&request).await;
        self.observe_latency(&upstream_id, call_started);
        drop(route.guard);

        let response = result
            .map_err(|e| self.dispatch_failed(&caller, &request, meta, &upstream_id, e, started))?;

        let usage = response.usage;
        let cost = self
            .cost(
                &request.model,
                Some(&upstream_id),
                usage.prompt_tokens as i64,
                usage.completion_tokens as i64,
                false,
            )
            .await
            .unwrap_or(usage.total_tokens as i64);

        if let Err(e) = self.deps.quota.deduct_quota(&caller.user_id, cost).await {
            tracing::warn!(user_id = %caller.user_id, cost, "Quota deduction failed: {}", e);
        }

        tracing::info!(
            model = %request.model,
            upstream_id = %upstream_id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost,
            "Request completed"
        );

        self.log(RequestLogRecord {
            upstream_id: Some(upstream_id),
            status_code: 200,
            tokens_used: usage.total_tokens as i64,
            ..self.record(&caller, &request, meta, started)
        });
        Ok(response)
    }

    async fn stream_inner(
        &self,
        key: Option<&str>,
        request: CanonicalRequest,
        meta: &RequestMeta,
    ) -> Result<ByteStream> {
        let started = Instant::now();
        let caller = self.authenticate(key).await?;

        let input = estimate_input_tokens(&request);
        let output = estimate_output_tokens(&request, input);
        let estimated_total = input + output;
        let model_cost = self
            .cost(&request.model, None, input, output, true)
            .await
            .unwrap_or(estimated_total);
        self.precheck_quota(&caller, &request, meta, model_cost, started)
            .await?;

        let route = self.route(&caller, &request, meta, started).await?;
        let upstream_id = route.config.id.clone();

        let cost = self
            .cost(&request.model, Some(&upstream_id), input, output, true)
            .await
            .unwrap_or(estimated_total);
        if cost != model_cost {
            self.precheck_quota(&caller, &request, meta, cost, started)
                .await?;
        }

        let adapter = self
            .deps
            .adapters
            .create(&route.config)
            .map_err(|e| self.dispatch_failed(&caller, &request, meta, &upstream_id, e, started))?;

        let call_started = Instant::now();
        let upstream = adapter
            .call_stream(&request)
            .await
            .map_err(|e| self.dispatch_failed(&caller, &request, meta, &upstream_id, e, started))?;
        self.observe_latency(&upstream_id, call_started);

        // Charged before the first byte reaches the client.
        if let Err(e) = self.deps.quota.deduct_quota(&caller.user_id, cost).await {
            drop(upstream);
            tracing::warn!(user_id = %caller.user_id, cost, "Upfront stream deduction failed: {}", e);
            self.log(RequestLogRecord {
                upstream_id: Some(upstream_id),
                status_code: e.status_code().as_u16(),
                error_message: Some(e.to_string()),
                is_streaming: true,
                ..self.record(&caller, &request, meta, started)
            });
            return Err(e);
        }

        tracing::info!(
            model = %request.model,
            upstream_id = %upstream_id,
            estimated_tokens = estimated_total,
            cost,
            "Stream opened"
        );

        self.log(RequestLogRecord {
            upstream_id: Some(upstream_id),
            status_code: 200,
            tokens_used: estimated_total,
            is_streaming: true,
            ..self.record(&caller, &request, meta, started)
        });

        let guard = route.guard;
        Ok(upstream
            .map(move |chunk| {
                let _slot = &guard;
                chunk
            })
            .boxed())
    }

    async fn precheck_quota(
        &self,
        caller: &Caller,
        request: &CanonicalRequest,
        meta: &RequestMeta,
        amount: i64,
        started: Instant,
    ) -> Result<()> {
        if self.deps.quota.check_quota(&caller.user_id, amount).await? {
            return Ok(());
        }
        tracing::warn!(user_id = %caller.user_id, amount, "{}", LOG_MESSAGE_INSUFFICIENT_QUOTA);
        self.log(RequestLogRecord {
            status_code: 429,
            error_message: Some(LOG_MESSAGE_INSUFFICIENT_QUOTA.to_string()),
            is_streaming: request.stream,
            ..self.record(caller, request, meta, started)
        });
        Err(AppError::InsufficientQuota)
    }

    async fn route(
        &self,
        caller: &Caller,
        request: &CanonicalRequest,
        meta: &RequestMeta,
        started: Instant,
    ) -> Result<RoutingDecision> {
        let candidates = self
            .deps
            .upstreams
            .find_active_by_model(&request.model)
            .await?;
        if candidates.is_empty() {
            tracing::warn!(model = %request.model, "{}", LOG_MESSAGE_NO_CONFIG);
            self.log(RequestLogRecord {
                status_code: 404,
                error_message: Some(LOG_MESSAGE_NO_CONFIG.to_string()),
                is_streaming: request.stream,
                ..self.record(caller, request, meta, started)
            });
            return Err(AppError::NoConfigAvailable);
        }

        let strategy = self
            .deps
            .lb_rules
            .find_active_by_model(&request.model)
            .await?
            .map(|rule| rule.strategy)
            .unwrap_or_else(|| Strategy::RoundRobin.as_str().to_string());

        let balancer = self.balancers.get(&request.model, &strategy);
        let config = balancer.select_config(&candidates)?;
        tracing::debug!(
            model = %request.model,
            strategy = %strategy,
            upstream_id = %config.id,
            candidates = candidates.len(),
            "Upstream selected"
        );

        let guard = ConnectionGuard::new(balancer, config.id.clone());
        Ok(RoutingDecision { config, guard })
    }

    /// Cost in whole credits. `None` when no price applies or it is zero.
    async fn cost(
        &self,
        model: &str,
        upstream_id: Option<&str>,
        input: i64,
        output: i64,
        is_estimate: bool,
    ) -> Option<i64> {
        match self
            .deps
            .pricing
            .calculate_cost(model, upstream_id, input, output, is_estimate)
            .await
        {
            Ok(Some(micro)) => Some(credits_from_micro(micro)).filter(|c| *c > 0),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(model = %model, "Pricing lookup failed: {}", e);
                None
            }
        }
    }

    fn dispatch_failed(
        &self,
        caller: &Caller,
        request: &CanonicalRequest,
        meta: &RequestMeta,
        upstream_id: &str,
        err: AppError,
        started: Instant,
    ) -> AppError {
        let err = upstream_failure(err);
        tracing::error!(
            model = %request.model,
            upstream_id = %upstream_id,
            "Upstream call failed: {}",
            err
        );
        self.log(RequestLogRecord {
            upstream_id: Some(upstream_id.to_string()),
            status_code: 500,
            error_message: Some(err.to_string()),
            is_streaming: request.stream,
            ..self.record(caller, request, meta, started)
        });
        err
    }

    fn record(
        &self,
        caller: &Caller,
        request: &CanonicalRequest,
        meta: &RequestMeta,
        started: Instant,
    ) -> RequestLogRecord {
        RequestLogRecord {
            request_id: get_request_id(),
            user_id: caller.user_id.clone(),
            api_key_id: caller.api_key_id.clone(),
            model: request.model.clone(),
            method: meta.method.clone(),
            path: meta.path.clone(),
            response_time_ms: started.elapsed().as_millis() as u64,
            is_streaming: request.stream,
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    fn log(&self, record: RequestLogRecord) {
        let sink = self.deps.request_log.clone();
        self.deps
            .queue
            .submit("request_log", async move { sink.record(record).await });
    }

    fn observe_latency(&self, upstream_id: &str, started: Instant) {
        get_metrics()
            .upstream_latency
            .with_label_values(&[upstream_id])
            .observe(started.elapsed().as_secs_f64());
    }

    fn count<T>(&self, meta: &RequestMeta, model: &str, result: &Result<T>) {
        let status = match result {
            Ok(_) => 200,
            Err(e) => e.status_code().as_u16(),
        }
        .to_string();
        get_metrics()
            .requests_total
            .with_label_values(&[meta.protocol.as_str(), model, status.as_str()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::request_logger::MemoryRequestLog;
    use crate::protocol::{Message, Role, Tool};
    use crate::services::pricing::InMemoryPricing;
    use crate::services::quota::InMemoryQuota;
    use crate::store::{ApiKey, LoadBalancerRule, MemoryStore, Pricing, User};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        orchestrator: GatewayOrchestrator,
        store: Arc<MemoryStore>,
        quota: Arc<InMemoryQuota>,
        pricing: Arc<InMemoryPricing>,
        log: Arc<MemoryRequestLog>,
        queue: Arc<BackgroundQueue>,
    }

    /// Approves every pre-check but refuses the charge, as when another
    /// request spends the balance in between.
    struct RacingQuota(Arc<InMemoryQuota>);

    #[async_trait::async_trait]
    impl QuotaService for RacingQuota {
        async fn check_quota(&self, user_id: &str, amount: i64) -> Result<bool> {
            self.0.check_quota(user_id, amount).await
        }

        async fn deduct_quota(&self, _user_id: &str, _amount: i64) -> Result<()> {
            Err(AppError::InsufficientQuota)
        }
    }

    impl Harness {
        fn new(quota: i64) -> Self {
            Self::with_quota_service(quota, |q| q as Arc<dyn QuotaService>)
        }

        fn with_quota_service(
            quota: i64,
            wrap: impl FnOnce(Arc<InMemoryQuota>) -> Arc<dyn QuotaService>,
        ) -> Self {
            let store = Arc::new(MemoryStore::new());
            store.insert_api_key(ApiKey {
                id: "key-1".to_string(),
                key: "sk-good".to_string(),
                user_id: "user-1".to_string(),
                name: "test".to_string(),
                is_active: true,
                last_used_at: None,
            });
            store.insert_api_key(ApiKey {
                id: "key-2".to_string(),
                key: "sk-disabled".to_string(),
                user_id: "user-1".to_string(),
                name: "off".to_string(),
                is_active: false,
                last_used_at: None,
            });
            let quota_svc = Arc::new(InMemoryQuota::from_users(&[User {
                id: "user-1".to_string(),
                quota,
                used_quota: 0,
            }]));
            let pricing = Arc::new(InMemoryPricing::new(Vec::new()));
            let log = Arc::new(MemoryRequestLog::new());
            let queue = Arc::new(BackgroundQueue::new(64));

            let orchestrator = GatewayOrchestrator::new(Collaborators {
                api_keys: store.clone(),
                upstreams: store.clone(),
                lb_rules: store.clone(),
                quota: wrap(quota_svc.clone()),
                pricing: pricing.clone(),
                request_log: log.clone(),
                adapters: Arc::new(AdapterFactory::new(true, 30)),
                queue: queue.clone(),
            });

            Self {
                orchestrator,
                store,
                quota: quota_svc,
                pricing,
                log,
                queue,
            }
        }

        fn add_upstream(&self, id: &str, base_url: &str) {
            self.store.insert_upstream(UpstreamConfig {
                id: id.to_string(),
                kind: "openai".to_string(),
                base_url: base_url.to_string(),
                api_key: "upstream-key".to_string(),
                models: vec!["gpt-4".to_string()],
                priority: 0,
                weight: 1,
                is_active: true,
                timeout_secs: 10,
            });
        }

        async fn drained_log(&self) -> Vec<RequestLogRecord> {
            self.queue.shutdown().await;
            self.log.records()
        }
    }

    fn meta() -> RequestMeta {
        RequestMeta::post(Protocol::OpenAi, "/v1/chat/completions")
    }

    fn request() -> CanonicalRequest {
        CanonicalRequest::new("gpt-4", vec![Message::new(Role::User, "hello")])
    }

    fn completion(prompt: u32, completion: u32) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": prompt, "completion_tokens": completion, "total_tokens": prompt + completion}
        })
    }

    #[test]
    fn test_estimates() {
        let mut req = CanonicalRequest::new("m", vec![Message::new(Role::User, "x".repeat(50))]);
        // (50 + 10) / 3 = 20
        assert_eq!(estimate_input_tokens(&req), 20);
        assert_eq!(estimate_output_tokens(&req, 20), 100);

        req.tools = vec![Tool::new("f", "", json!({}))];
        // (60 + 150) / 3 = 70
        assert_eq!(estimate_input_tokens(&req), 70);

        let tiny = CanonicalRequest::new("m", vec![Message::new(Role::User, "")]);
        assert_eq!(estimate_input_tokens(&tiny), 10);

        assert_eq!(estimate_output_tokens(&req, 10_000), 2000);
        req.max_tokens = Some(64);
        assert_eq!(estimate_output_tokens(&req, 10_000), 64);
    }

    #[test]
    fn test_upstream_failure_is_not_double_wrapped() {
        let err = upstream_failure(AppError::ApiCallFailed("API returned status 500: x".into()));
        assert_eq!(err.to_string(), "API call failed: API returned status 500: x");

        let err = upstream_failure(AppError::NoHealthyCredential);
        assert_eq!(err.to_string(), "API call failed: no healthy credential available");
    }

    #[tokio::test]
    async fn test_invalid_keys_are_rejected() {
        let h = Harness::new(1000);
        for key in [None, Some(""), Some("sk-unknown"), Some("sk-disabled")] {
            assert_matches!(
                h.orchestrator.complete(key, request(), &meta()).await,
                Err(AppError::InvalidApiKey)
            );
        }
    }

    #[tokio::test]
    async fn test_insufficient_quota_logs_429() {
        let h = Harness::new(5);
        let result = h.orchestrator.complete(Some("sk-good"), request(), &meta()).await;
        assert_matches!(result, Err(AppError::InsufficientQuota));

        let records = h.drained_log().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 429);
        assert_eq!(records[0].user_id, "user-1");
        assert_eq!(records[0].error_message.as_deref(), Some("Insufficient quota"));
    }

    #[tokio::test]
    async fn test_unknown_model_logs_404() {
        let h = Harness::new(10_000);
        let result = h.orchestrator.complete(Some("sk-good"), request(), &meta()).await;
        assert_matches!(result, Err(AppError::NoConfigAvailable));

        let records = h.drained_log().await;
        assert_eq!(records[0].status_code, 404);
    }

    #[tokio::test]
    async fn test_buffered_success_charges_total_tokens_without_pricing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(12, 30)))
            .expect(1)
            .mount(&server)
            .await;

        let h = Harness::new(10_000);
        h.add_upstream("up-1", &server.uri());

        let response = h
            .orchestrator
            .complete(Some("sk-good"), request(), &meta())
            .await
            .unwrap();
        assert_eq!(response.usage.total_tokens, 42);
        assert_eq!(h.quota.used("user-1"), Some(42));

        let records = h.drained_log().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 200);
        assert_eq!(records[0].tokens_used, 42);
        assert_eq!(records[0].upstream_id.as_deref(), Some("up-1"));
        assert_eq!(records[0].api_key_id, "key-1");
    }

    #[tokio::test]
    async fn test_buffered_success_uses_pricing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(1000, 1000)))
            .mount(&server)
            .await;

        let h = Harness::new(10_000);
        h.add_upstream("up-1", &server.uri());
        h.pricing.insert(Pricing {
            model: "gpt-4".to_string(),
            upstream_id: None,
            input_price: 1.5,
            output_price: 2.0,
            unit: 1000,
            is_active: true,
        });

        h.orchestrator
            .complete(Some("sk-good"), request(), &meta())
            .await
            .unwrap();
        // 1.5 + 2.0 = 3.5 credits = 3500 micro, rounded up to 4
        assert_eq!(h.quota.used("user-1"), Some(4));
    }

    #[tokio::test]
    async fn test_upstream_failure_logs_500() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let h = Harness::new(10_000);
        h.add_upstream("up-1", &server.uri());

        let err = h
            .orchestrator
            .complete(Some("sk-good"), request(), &meta())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "API call failed: API returned status 500: boom");
        assert_eq!(h.quota.used("user-1"), Some(0));

        let records = h.drained_log().await;
        assert_eq!(records[0].status_code, 500);
        assert_eq!(records[0].tokens_used, 0);
        assert!(records[0].error_message.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_round_robin_spreads_across_upstreams() {
        let first = MockServer::start().await;
        let second = MockServer::start().await;
        for server in [&first, &second] {
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_json(completion(1, 1)))
                .expect(2)
                .mount(server)
                .await;
        }

        let h = Harness::new(10_000);
        h.add_upstream("a", &first.uri());
        h.add_upstream("b", &second.uri());

        for _ in 0..4 {
            h.orchestrator
                .complete(Some("sk-good"), request(), &meta())
                .await
                .unwrap();
        }
        assert_eq!(h.orchestrator.balancers().len(), 1);
    }

    #[tokio::test]
    async fn test_lb_rule_selects_strategy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(1, 1)))
            .mount(&server)
            .await;

        let h = Harness::new(10_000);
        h.add_upstream("a", &server.uri());
        h.store.insert_lb_rule(LoadBalancerRule {
            model: "gpt-4".to_string(),
            strategy: "least_connections".to_string(),
            is_active: true,
        });

        h.orchestrator
            .complete(Some("sk-good"), request(), &meta())
            .await
            .unwrap();
        let balancer = h.orchestrator.balancers().get("gpt-4", "least_connections");
        assert_eq!(balancer.strategy(), Strategy::LeastConnections);
        assert_eq!(h.orchestrator.balancers().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_deducts_estimate_upfront_and_relays() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let h = Harness::new(10_000);
        h.add_upstream("up-1", &server.uri());

        let mut req = request();
        req.stream = true;
        req.max_tokens = Some(50);
        let expected = estimate_input_tokens(&req) + 50;

        let mut stream = h
            .orchestrator
            .stream(Some("sk-good"), req, &meta())
            .await
            .unwrap();
        assert_eq!(h.quota.used("user-1"), Some(expected));

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(String::from_utf8(body).unwrap(), sse);
        drop(stream);

        let records = h.drained_log().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].is_streaming);
        assert_eq!(records[0].tokens_used, expected);
    }

    #[tokio::test]
    async fn test_stream_refused_when_estimate_exceeds_quota() {
        let h = Harness::new(50);
        h.add_upstream("up-1", "http://127.0.0.1:9");

        let mut req = request();
        req.stream = true;
        req.max_tokens = Some(4096);

        assert!(matches!(
            h.orchestrator.stream(Some("sk-good"), req, &meta()).await,
            Err(AppError::InsufficientQuota)
        ));
        assert_eq!(h.quota.used("user-1"), Some(0));
    }

    #[tokio::test]
    async fn test_stream_closed_when_charge_fails_after_open() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("data: [DONE]\n\n", "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = Harness::with_quota_service(10_000, |q| Arc::new(RacingQuota(q)));
        h.add_upstream("up-1", &server.uri());

        let mut req = request();
        req.stream = true;

        assert!(matches!(
            h.orchestrator.stream(Some("sk-good"), req, &meta()).await,
            Err(AppError::InsufficientQuota)
        ));
        assert_eq!(h.quota.used("user-1"), Some(0));

        let records = h.drained_log().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status_code, 402);
        assert!(records[0].is_streaming);
        assert_eq!(records[0].upstream_id.as_deref(), Some("up-1"));
        assert_eq!(records[0].error_message.as_deref(), Some("insufficient quota"));
        server.verify().await;
    }
}
