//! Kiro provider: token refresh, health checks, adapter creation and the
//! AWS OIDC device-code flow.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::provider::{
    DeviceAuthorization, DeviceCodeProvider, OAuthProvider, Provider, TokenGrant, TokenPoll,
};
use crate::adapter::kiro::{default_api_base, KiroAdapter, DEFAULT_REGION};
use crate::adapter::{ensure_success, Adapter, DEFAULT_TIMEOUT};
use crate::core::config::KiroConfig;
use crate::core::error::{AppError, Result};
use crate::store::{Credential, CredentialAuth};

pub const PROVIDER_NAME: &str = "kiro";

/// Tokens this close to expiry are reported as unhealthy.
const EXPIRY_WARNING_MINUTES: i64 = 5;

const START_URL: &str = "https://view.awsapps.com/start";
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const SCOPES: [&str; 3] = [
    "codewhisperer:completions",
    "codewhisperer:analysis",
    "codewhisperer:conversations",
];

pub struct KiroProvider {
    client: reqwest::Client,
    endpoints: KiroConfig,
    timeout: std::time::Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    profile_arn: Option<String>,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientRegistration {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

impl KiroProvider {
    /// `endpoints` overrides the production hosts; unset fields derive them
    /// from the credential's region.
    pub fn new(client: reqwest::Client, endpoints: KiroConfig) -> Self {
        Self {
            client,
            endpoints,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadline for token calls and for assistant calls made by its adapters.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn auth_base(&self, region: &str) -> String {
        match &self.endpoints.auth_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://prod.{}.auth.desktop.kiro.dev", region),
        }
    }

    fn oidc_base(&self, region: &str) -> String {
        match &self.endpoints.oidc_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://oidc.{}.amazonaws.com", region),
        }
    }

    fn api_base(&self, region: &str) -> String {
        match &self.endpoints.api_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => default_api_base(region),
        }
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        Ok(response)
    }
}

fn region_or_default(region: &Option<String>) -> &str {
    region
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REGION)
}

/// Region of the assistant endpoint. Builder ID logins live in their IdC region.
fn api_region(credential: &Credential) -> &str {
    match &credential.auth {
        CredentialAuth::RefreshToken { region, .. } => region_or_default(region),
        CredentialAuth::BuilderId { idc_region, .. } => region_or_default(idc_region),
    }
}

/// Next UTC midnight after `now`.
fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .unwrap_or(now + Duration::days(1))
}

/// Reset the daily counter once its reset time has passed.
fn roll_daily_quota(credential: &mut Credential, now: DateTime<Utc>) {
    let due = credential.quota_reset_at.map(|at| at <= now).unwrap_or(true);
    if due {
        credential.daily_used = 0;
        credential.quota_reset_at = Some(next_utc_midnight(now));
    }
}

#[async_trait]
impl Provider for KiroProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn refresh_token(&self, credential: &mut Credential) -> Result<()> {
        let (url, body) = match &credential.auth {
            CredentialAuth::BuilderId {
                client_id,
                client_secret,
                refresh_token,
                idc_region,
            } => (
                format!("{}/token", self.oidc_base(region_or_default(idc_region))),
                json!({
                    "clientId": client_id,
                    "clientSecret": client_secret,
                    "refreshToken": refresh_token,
                    "grantType": "refresh_token",
                }),
            ),
            CredentialAuth::RefreshToken {
                refresh_token,
                region,
            } => (
                format!("{}/refreshToken", self.auth_base(region_or_default(region))),
                json!({ "refreshToken": refresh_token }),
            ),
        };

        tracing::debug!(
            credential_id = %credential.id,
            auth_type = credential.auth.auth_type(),
            "Refreshing Kiro token"
        );

        let response = self.post_json(&url, &body).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::TokenRefresh(format!(
                "refresh failed (status {}): {}",
                status.as_u16(),
                text
            )));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AppError::TokenRefresh(format!("invalid refresh response: {}", e)))?;

        let now = Utc::now();
        credential.access_token = Some(refreshed.access_token);
        if let Some(token) = refreshed.refresh_token.filter(|t| !t.is_empty()) {
            credential.auth.set_refresh_token(token);
        }
        if let Some(arn) = refreshed.profile_arn.filter(|a| !a.is_empty()) {
            credential.profile_arn = Some(arn);
        }
        credential.expires_at = Some(now + Duration::seconds(refreshed.expires_in));
        roll_daily_quota(credential, now);

        tracing::info!(
            credential_id = %credential.id,
            expires_at = ?credential.expires_at,
            "Kiro token refreshed"
        );
        Ok(())
    }

    async fn check_health(&self, credential: &Credential) -> Result<()> {
        let now = Utc::now();
        if credential.is_expired(now) {
            return Err(AppError::CredentialUnhealthy("token expired".to_string()));
        }
        if credential.expires_within(now, Duration::minutes(EXPIRY_WARNING_MINUTES)) {
            return Err(AppError::CredentialUnhealthy(
                "token expiring soon".to_string(),
            ));
        }
        Ok(())
    }

    fn create_adapter(&self, credential: &Credential) -> Result<Arc<dyn Adapter>> {
        let access_token = credential
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AppError::AdapterCreation("access_token not found in credentials".to_string())
            })?;

        Ok(Arc::new(
            KiroAdapter::new(
                self.client.clone(),
                &self.api_base(api_region(credential)),
                access_token,
                credential.profile_arn.clone(),
            )
            .with_timeout(self.timeout),
        ))
    }

    fn as_oauth(&self) -> Option<&dyn OAuthProvider> {
        Some(self)
    }

    fn as_device_code(&self) -> Option<&dyn DeviceCodeProvider> {
        Some(self)
    }
}

impl OAuthProvider for KiroProvider {
    fn auth_url(&self, state: &str) -> String {
        format!("{}/authorize?state={}", self.auth_base(DEFAULT_REGION), state)
    }
}

#[async_trait]
impl DeviceCodeProvider for KiroProvider {
    async fn initiate_device_code(&self) -> Result<DeviceAuthorization> {
        let oidc = self.oidc_base(DEFAULT_REGION);

        let response = self
            .post_json(
                &format!("{}/client/register", oidc),
                &json!({
                    "clientName": "Kiro IDE",
                    "clientType": "public",
                    "scopes": SCOPES,
                }),
            )
            .await?;
        let registration: ClientRegistration = ensure_success(response).await?.json().await?;

        let response = self
            .post_json(
                &format!("{}/device_authorization", oidc),
                &json!({
                    "clientId": registration.client_id,
                    "clientSecret": registration.client_secret,
                    "startUrl": START_URL,
                }),
            )
            .await?;
        let device: DeviceAuthorizationResponse = ensure_success(response).await?.json().await?;

        tracing::info!(
            user_code = %device.user_code,
            expires_in = device.expires_in,
            "Kiro device authorization started"
        );

        Ok(DeviceAuthorization {
            device_code: device.device_code,
            user_code: device.user_code,
            verification_uri: device.verification_uri,
            verification_uri_complete: device.verification_uri_complete,
            expires_in: device.expires_in,
            interval: device.interval,
            client_id: registration.client_id,
            client_secret: registration.client_secret,
            region: DEFAULT_REGION.to_string(),
        })
    }

    async fn exchange_device_code(&self, authorization: &DeviceAuthorization) -> Result<TokenPoll> {
        let response = self
            .post_json(
                &format!("{}/token", self.oidc_base(&authorization.region)),
                &json!({
                    "clientId": authorization.client_id,
                    "clientSecret": authorization.client_secret,
                    "deviceCode": authorization.device_code,
                    "grantType": DEVICE_GRANT_TYPE,
                }),
            )
            .await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(classify_token_response(status.as_u16(), &body))
    }
}

fn classify_token_response(status: u16, body: &Value) -> TokenPoll {
    if let Some(access_token) = body.get("accessToken").and_then(Value::as_str) {
        return TokenPoll::Granted(TokenGrant {
            access_token: access_token.to_string(),
            refresh_token: body
                .get("refreshToken")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            expires_in: body.get("expiresIn").and_then(Value::as_i64).unwrap_or(3600),
        });
    }

    match body.get("error").and_then(Value::as_str) {
        Some("authorization_pending") => TokenPoll::Pending,
        Some("slow_down") => TokenPoll::SlowDown,
        Some(error) => {
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if description.is_empty() {
                TokenPoll::Failed(error.to_string())
            } else {
                TokenPoll::Failed(format!("{}: {}", error, description))
            }
        }
        None => TokenPoll::Failed(format!("unexpected token response (status {})", status)),
    }
}
