//! Credential login endpoints.
//!
//! `initiate` starts a device-code session whose poll task runs in the
//! background and `poll` allows a single manual exchange. The `sessions`
//! routes inspect or cancel a login; the `pools` routes check or delete a pool.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::AppState;
use crate::accountpool::kiro::PROVIDER_NAME as KIRO;
use crate::core::error::{AppError, Result};
use crate::store::Credential;

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    #[serde(alias = "poolId")]
    pub pool_id: String,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    KIRO.to_string()
}

#[derive(Debug, Deserialize)]
pub struct PollRequest {
    #[serde(alias = "deviceCode")]
    pub device_code: String,
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| AppError::MalformedRequest {
        field: None,
        message: format!("invalid JSON body: {}", e),
    })
}

/// Public view of a credential. Tokens never leave the gateway.
fn credential_view(credential: &Credential) -> Value {
    json!({
        "id": credential.id,
        "provider": credential.provider,
        "pool_id": credential.pool_id,
        "name": credential.name,
        "auth_type": credential.auth.auth_type(),
        "is_active": credential.is_active,
        "expires_at": credential.expires_at,
    })
}

/// `POST /api/oauth/initiate`
///
/// Providers without a device flow but with a browser flow answer with just
/// `authUrl`.
pub async fn initiate(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>> {
    let request: InitiateRequest = parse(&body)?;

    match state.sessions.start(&request.pool_id, &request.provider).await {
        Ok(auth) => Ok(Json(json!({
            "authUrl": auth.verification_uri_complete,
            "authInfo": {
                "device_code": auth.device_code,
                "user_code": auth.user_code,
                "verification_uri": auth.verification_uri,
                "verification_uri_complete": auth.verification_uri_complete,
                "expires_in": auth.expires_in,
                "interval": auth.interval,
            }
        }))),
        Err(AppError::DeviceFlowUnsupported(name)) => {
            let provider = state.registry.get(&name)?;
            let oauth = provider
                .as_oauth()
                .ok_or_else(|| AppError::DeviceFlowUnsupported(name.clone()))?;
            let auth_state = uuid::Uuid::new_v4().to_string();
            Ok(Json(json!({
                "authUrl": oauth.auth_url(&auth_state),
                "state": auth_state,
            })))
        }
        Err(e) => Err(e),
    }
}

/// `POST /api/oauth/poll`: 202 while the user has not approved yet.
pub async fn poll(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    let request: PollRequest = parse(&body)?;

    match state.sessions.poll_once(&request.device_code).await {
        Ok(credential) => Ok(Json(json!({
            "status": "approved",
            "credential": credential_view(&credential),
        }))
        .into_response()),
        Err(AppError::AuthorizationPending) => {
            Ok((StatusCode::ACCEPTED, Json(json!({ "status": "pending" }))).into_response())
        }
        Err(e) => Err(e),
    }
}

/// `GET /api/oauth/sessions/:device_code`
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(device_code): Path<String>,
) -> Result<Json<Value>> {
    let status = state
        .sessions
        .status(&device_code)
        .ok_or_else(|| AppError::SessionNotFound(device_code.clone()))?;
    Ok(Json(json!({ "device_code": device_code, "status": status })))
}

/// `DELETE /api/oauth/sessions/:device_code`
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(device_code): Path<String>,
) -> Result<StatusCode> {
    if state.sessions.cancel(&device_code) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::SessionNotFound(device_code))
    }
}

/// `DELETE /api/pools/:pool_id`: removes the pool and stops its logins.
pub async fn delete_pool(
    State(state): State<Arc<AppState>>,
    Path(pool_id): Path<String>,
) -> Result<StatusCode> {
    if state.sessions.remove_pool(&pool_id).await? {
        tracing::info!(pool_id = %pool_id, "Pool deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::PoolNotFound(pool_id))
    }
}

/// `GET /api/pools/:pool_id/health`: check every active credential.
pub async fn pool_health(
    State(state): State<Arc<AppState>>,
    Path(pool_id): Path<String>,
) -> Result<Json<Value>> {
    let reports = state.pool.check_pool_health(&pool_id).await?;
    let healthy = reports.iter().filter(|r| r.is_healthy()).count();
    let credentials: Vec<Value> = reports
        .iter()
        .map(|r| {
            json!({
                "credential_id": r.credential_id,
                "healthy": r.is_healthy(),
                "error": r.error,
            })
        })
        .collect();
    Ok(Json(json!({
        "pool_id": pool_id,
        "healthy": healthy,
        "total": reports.len(),
        "credentials": credentials,
    })))
}
