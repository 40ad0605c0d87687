//! API layer for the gateway.
//!
//! This module contains the protocol proxy handlers, the credential login
//! endpoints, streaming support and the router that ties them together.

pub mod auth;
pub mod handlers;
pub mod health;
pub mod oauth;
pub mod streaming;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::accountpool::{CredentialPool, DeviceCodeSessions, Registry};
use crate::protocol::CodecRegistry;
use crate::services::GatewayOrchestrator;

// Re-export commonly used types
pub use auth::{extract_api_key, hash_key};
pub use handlers::{chat_completions, gemini_action, messages};
pub use health::{health, metrics_handler};

/// Shared application state.
pub struct AppState {
    pub orchestrator: Arc<GatewayOrchestrator>,
    pub codecs: Arc<CodecRegistry>,
    pub sessions: DeviceCodeSessions,
    pub registry: Arc<Registry>,
    pub pool: Arc<CredentialPool>,
}

/// Build the router with all endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/models/*action", post(gemini_action))
        .route("/api/oauth/initiate", post(oauth::initiate))
        .route("/api/oauth/poll", post(oauth::poll))
        .route(
            "/api/oauth/sessions/:device_code",
            get(oauth::session_status).delete(oauth::cancel_session),
        )
        .route("/api/pools/:pool_id", delete(oauth::delete_pool))
        .route("/api/pools/:pool_id/health", get(oauth::pool_health))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
