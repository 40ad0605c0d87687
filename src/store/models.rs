//! Records shared by the stores, the router and the credential pool.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A caller of the gateway. Only the quota balance matters to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub used_quota: i64,
}

impl User {
    pub fn remaining(&self) -> i64 {
        self.quota - self.used_quota
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key: String,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// One upstream route the balancer can pick. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub id: String,
    /// `openai`, `anthropic`, `gemini`, `custom` or `account_pool:<provider>:<pool_id>`
    pub kind: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Weight used for selection. Non-positive weights count as 1.
    pub fn effective_weight(&self) -> u64 {
        if self.weight <= 0 {
            1
        } else {
            self.weight as u64
        }
    }

    pub fn upstream_kind(&self) -> UpstreamKind {
        UpstreamKind::parse(&self.kind)
    }
}

/// Parsed form of [`UpstreamConfig::kind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamKind {
    OpenAi,
    Anthropic,
    Gemini,
    /// OpenAI-compatible endpoint
    Custom,
    AccountPool { provider: String, pool_id: String },
    Unknown(String),
}

impl UpstreamKind {
    pub fn parse(kind: &str) -> Self {
        if let Some(rest) = kind.strip_prefix("account_pool:") {
            if let Some((provider, pool_id)) = rest.split_once(':') {
                if !provider.is_empty() && !pool_id.is_empty() {
                    return UpstreamKind::AccountPool {
                        provider: provider.to_string(),
                        pool_id: pool_id.to_string(),
                    };
                }
            }
            return UpstreamKind::Unknown(kind.to_string());
        }

        match kind.to_lowercase().as_str() {
            "openai" => UpstreamKind::OpenAi,
            "anthropic" => UpstreamKind::Anthropic,
            "gemini" => UpstreamKind::Gemini,
            "custom" => UpstreamKind::Custom,
            _ => UpstreamKind::Unknown(kind.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPool {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Auth material carried by a credential. The variant selects the refresh mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialAuth {
    RefreshToken {
        refresh_token: String,
        #[serde(default)]
        region: Option<String>,
    },
    BuilderId {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        idc_region: Option<String>,
    },
}

impl CredentialAuth {
    pub fn refresh_token(&self) -> &str {
        match self {
            CredentialAuth::RefreshToken { refresh_token, .. }
            | CredentialAuth::BuilderId { refresh_token, .. } => refresh_token,
        }
    }

    pub fn set_refresh_token(&mut self, token: String) {
        match self {
            CredentialAuth::RefreshToken { refresh_token, .. }
            | CredentialAuth::BuilderId { refresh_token, .. } => *refresh_token = token,
        }
    }

    pub fn auth_type(&self) -> &'static str {
        match self {
            CredentialAuth::RefreshToken { .. } => "refresh_token",
            CredentialAuth::BuilderId { .. } => "builder_id",
        }
    }
}

/// A provider credential. Never hard-deleted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub auth: CredentialAuth,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub profile_arn: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub last_check_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub daily_quota: Option<i64>,
    #[serde(default)]
    pub daily_used: i64,
    #[serde(default)]
    pub quota_reset_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Fresh credential with zeroed counters.
    pub fn new(id: impl Into<String>, provider: impl Into<String>, auth: CredentialAuth) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            pool_id: None,
            name: String::new(),
            auth,
            access_token: None,
            profile_arn: None,
            expires_at: None,
            is_active: true,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            last_used_at: None,
            error_message: None,
            last_check_at: None,
            daily_quota: None,
            daily_used: 0,
            quota_reset_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// True when the token expires within `horizon` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        self.expires_at.map(|at| at <= now + horizon).unwrap_or(false)
    }

    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerRule {
    pub model: String,
    pub strategy: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Per-model price, in credits per `unit` tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    pub model: String,
    #[serde(default)]
    pub upstream_id: Option<String>,
    #[serde(default)]
    pub input_price: f64,
    #[serde(default)]
    pub output_price: f64,
    #[serde(default = "default_pricing_unit")]
    pub unit: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> i32 {
    1
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_pricing_unit() -> i64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(kind: &str, weight: i32) -> UpstreamConfig {
        UpstreamConfig {
            id: "u1".to_string(),
            kind: kind.to_string(),
            base_url: String::new(),
            api_key: String::new(),
            models: vec!["gpt-4".to_string()],
            priority: 0,
            weight,
            is_active: true,
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_upstream_kind_parse() {
        assert_eq!(UpstreamKind::parse("openai"), UpstreamKind::OpenAi);
        assert_eq!(UpstreamKind::parse("Gemini"), UpstreamKind::Gemini);
        assert_eq!(
            UpstreamKind::parse("account_pool:kiro:pool-1"),
            UpstreamKind::AccountPool {
                provider: "kiro".to_string(),
                pool_id: "pool-1".to_string()
            }
        );
        assert!(matches!(
            UpstreamKind::parse("account_pool:kiro"),
            UpstreamKind::Unknown(_)
        ));
        assert!(matches!(UpstreamKind::parse("bedrock"), UpstreamKind::Unknown(_)));
    }

    #[test]
    fn test_effective_weight() {
        assert_eq!(upstream("openai", 0).effective_weight(), 1);
        assert_eq!(upstream("openai", -4).effective_weight(), 1);
        assert_eq!(upstream("openai", 3).effective_weight(), 3);
        assert!(upstream("openai", 1).supports_model("gpt-4"));
        assert!(!upstream("openai", 1).supports_model("gpt-3.5"));
    }

    #[test]
    fn test_credential_expiry() {
        let now = Utc::now();
        let mut cred = Credential::new(
            "c1",
            "kiro",
            CredentialAuth::RefreshToken {
                refresh_token: "rt".to_string(),
                region: None,
            },
        );
        assert!(cred.is_selectable(now));

        cred.expires_at = Some(now + Duration::minutes(3));
        assert!(!cred.is_expired(now));
        assert!(cred.expires_within(now, Duration::minutes(5)));
        assert!(cred.is_selectable(now));

        cred.expires_at = Some(now - Duration::seconds(1));
        assert!(!cred.is_selectable(now));

        cred.expires_at = None;
        cred.is_active = false;
        assert!(!cred.is_selectable(now));
    }

    #[test]
    fn test_credential_auth_tagged_serde() {
        let auth: CredentialAuth = serde_json::from_value(serde_json::json!({
            "type": "builder_id",
            "client_id": "cid",
            "client_secret": "secret",
            "refresh_token": "rt",
        }))
        .unwrap();
        assert_eq!(auth.auth_type(), "builder_id");
        assert_eq!(auth.refresh_token(), "rt");
    }
}
