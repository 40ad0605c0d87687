//! Configuration management for the gateway.
//!
//! Sources are layered with the `config` crate, later layers winning:
//! built-in defaults, an optional YAML file (`GATEWAY_CONFIG`, default
//! `gateway.yaml`) with `${VAR}` expansion, `GATEWAY__*` environment variables,
//! and finally the plain `HOST`, `PORT`, `VERIFY_SSL` and
//! `REQUEST_TIMEOUT_SECS` overrides.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::store::models::{
    AccountPool, ApiKey, Credential, LoadBalancerRule, Pricing, UpstreamConfig, User,
};

/// Default config file looked up when `GATEWAY_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "gateway.yaml";

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Request timeout in seconds for upstream providers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Capacity of the background work queue
    #[serde(default = "default_queue_capacity")]
    pub background_queue_capacity: usize,

    /// Credentials expiring within this window are refreshed in the background
    #[serde(default = "default_refresh_horizon")]
    pub credential_refresh_horizon_secs: i64,

    #[serde(default)]
    pub device_code: DeviceCodeConfig,

    #[serde(default)]
    pub kiro: KiroConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Records loaded into the in-memory stores at startup
    #[serde(default)]
    pub seed: SeedData,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Timing of the device-code polling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCodeConfig {
    /// Interval units added to the wait after a `slow_down` answer
    #[serde(default = "default_slow_down_backoff")]
    pub slow_down_backoff_secs: u64,

    /// Length of one `interval` unit in milliseconds
    #[serde(default = "default_poll_unit_ms")]
    pub poll_unit_ms: u64,

    /// How long a finished session's outcome stays queryable
    #[serde(default = "default_outcome_ttl")]
    pub outcome_ttl_secs: u64,
}

impl Default for DeviceCodeConfig {
    fn default() -> Self {
        Self {
            slow_down_backoff_secs: default_slow_down_backoff(),
            poll_unit_ms: default_poll_unit_ms(),
            outcome_ttl_secs: default_outcome_ttl(),
        }
    }
}

/// Periodic account-pool upkeep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Whether the maintenance task runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between health sweeps over every pool
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Seconds between proactive refresh sweeps
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Credentials expiring within this many seconds are refreshed
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval_secs: default_health_check_interval(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_window_secs: default_refresh_window(),
        }
    }
}

/// Endpoint overrides for the Kiro provider. Unset fields use the
/// region-derived production hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KiroConfig {
    #[serde(default)]
    pub auth_base_url: Option<String>,
    #[serde(default)]
    pub oidc_base_url: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub pools: Vec<AccountPool>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub lb_rules: Vec<LoadBalancerRule>,
    #[serde(default)]
    pub pricing: Vec<Pricing>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            verify_ssl: default_verify_ssl(),
            request_timeout_secs: default_request_timeout(),
            background_queue_capacity: default_queue_capacity(),
            credential_refresh_horizon_secs: default_refresh_horizon(),
            device_code: DeviceCodeConfig::default(),
            kiro: KiroConfig::default(),
            maintenance: MaintenanceConfig::default(),
            seed: SeedData::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18000
}

fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_refresh_horizon() -> i64 {
    300
}

fn default_slow_down_backoff() -> u64 {
    5
}

fn default_poll_unit_ms() -> u64 {
    1000
}

fn default_outcome_ttl() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    300
}

fn default_refresh_interval() -> u64 {
    1800
}

fn default_refresh_window() -> i64 {
    1800
}

impl GatewayConfig {
    /// Load configuration from `GATEWAY_CONFIG`, or `gateway.yaml` when it exists.
    ///
    /// A file named explicitly through `GATEWAY_CONFIG` must exist; the default
    /// file is optional.
    pub fn load() -> Result<Self> {
        match std::env::var("GATEWAY_CONFIG") {
            Ok(path) => Self::load_from(Some(&path)),
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from(Some(DEFAULT_CONFIG_PATH))
            }
            Err(_) => Self::load_from(None),
        }
    }

    /// Load configuration, reading `path` as YAML if given.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_gateway::core::config::GatewayConfig;
    ///
    /// let config = GatewayConfig::load_from(Some("gateway.yaml")).expect("Failed to load config");
    /// ```
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let defaults = Config::try_from(&GatewayConfig::default())
            .context("Failed to build default configuration")?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            let expanded = expand_env_vars(&content);
            builder = builder.add_source(File::from_str(&expanded, FileFormat::Yaml));
        }

        builder = builder.add_source(
            Environment::with_prefix("GATEWAY")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: GatewayConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| match path {
                Some(p) => format!("Failed to parse config file: {}", p),
                None => "Failed to parse configuration".to_string(),
            })?;

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }

        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(verify_ssl_str) = std::env::var("VERIFY_SSL") {
            self.verify_ssl = str_to_bool(&verify_ssl_str);
        }

        if let Ok(timeout_str) = std::env::var("REQUEST_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout_str.parse::<u64>() {
                self.request_timeout_secs = timeout;
            }
        }
    }
}

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"["']?\$\{([^}:]+)(?::?-?([^}]*))?\}["']?"#).unwrap_or_else(|e| {
        panic!("invalid env var pattern: {}", e)
    })
});

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
pub fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn clear_overrides() {
        unsafe {
            std::env::remove_var("HOST");
            std::env::remove_var("PORT");
            std::env::remove_var("VERIFY_SSL");
            std::env::remove_var("REQUEST_TIMEOUT_SECS");
            std::env::remove_var("GATEWAY__SERVER__PORT");
            std::env::remove_var("GATEWAY__BACKGROUND_QUEUE_CAPACITY");
        }
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("GW_TEST_VAR", "test_value");
        }
        assert_eq!(expand_env_vars("api_key: ${GW_TEST_VAR}"), "api_key: test_value");
        unsafe {
            std::env::remove_var("GW_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        unsafe {
            std::env::remove_var("GW_MISSING_VAR");
        }
        assert_eq!(
            expand_env_vars("api_key: ${GW_MISSING_VAR:-default_value}"),
            "api_key: default_value"
        );
        assert_eq!(
            expand_env_vars("api_key: ${GW_MISSING_VAR:default_value}"),
            "api_key: default_value"
        );
        assert_eq!(expand_env_vars("api_key: ${GW_MISSING_VAR:-}"), "api_key: ");
    }

    #[test]
    fn test_str_to_bool() {
        assert!(str_to_bool("true"));
        assert!(str_to_bool("YES"));
        assert!(str_to_bool("1"));
        assert!(str_to_bool("On"));
        assert!(!str_to_bool("false"));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool(""));
        assert!(!str_to_bool("invalid"));
    }

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        clear_overrides();
        let config = GatewayConfig::load_from(None).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 18000);
        assert!(config.verify_ssl);
        assert_eq!(config.request_timeout_secs, 300);
        assert_eq!(config.background_queue_capacity, 1000);
        assert_eq!(config.credential_refresh_horizon_secs, 300);
        assert_eq!(config.device_code.slow_down_backoff_secs, 5);
        assert_eq!(config.device_code.poll_unit_ms, 1000);
        assert_eq!(config.device_code.outcome_ttl_secs, 600);
        assert!(config.maintenance.enabled);
        assert_eq!(config.maintenance.health_check_interval_secs, 300);
        assert_eq!(config.maintenance.refresh_interval_secs, 1800);
        assert!(config.seed.upstreams.is_empty());
    }

    #[test]
    #[serial]
    fn test_load_config_from_file() {
        clear_overrides();
        let temp_file = write_config(
            r#"
server:
  host: 127.0.0.1
  port: 8080
verify_ssl: false
seed:
  users:
    - id: u1
      quota: 5000
  api_keys:
    - id: k1
      key: sk-test
      user_id: u1
  upstreams:
    - id: up1
      kind: openai
      base_url: http://localhost:8000
      api_key: upstream-key
      models: [gpt-4]
      weight: 2
  credentials:
    - id: c1
      provider: kiro
      pool_id: p1
      auth:
        type: refresh_token
        refresh_token: rt-1
  lb_rules:
    - model: gpt-4
      strategy: least_connections
"#,
        );

        let config = GatewayConfig::load_from(temp_file.path().to_str()).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(!config.verify_ssl);
        assert_eq!(config.seed.users[0].quota, 5000);
        assert_eq!(config.seed.api_keys[0].user_id, "u1");
        assert!(config.seed.api_keys[0].is_active);
        assert_eq!(config.seed.upstreams[0].weight, 2);
        assert_eq!(config.seed.upstreams[0].models, vec!["gpt-4".to_string()]);
        assert_eq!(config.seed.credentials[0].auth.refresh_token(), "rt-1");
        assert_eq!(config.seed.lb_rules[0].strategy, "least_connections");
    }

    #[test]
    #[serial]
    fn test_load_config_with_env_expansion() {
        clear_overrides();
        unsafe {
            std::env::set_var("GW_TEST_UPSTREAM_KEY", "env_api_key");
        }

        let temp_file = write_config(
            r#"
seed:
  upstreams:
    - id: up1
      kind: openai
      api_key: ${GW_TEST_UPSTREAM_KEY}
      models: [gpt-4]
"#,
        );

        let config = GatewayConfig::load_from(temp_file.path().to_str()).unwrap();
        assert_eq!(config.seed.upstreams[0].api_key, "env_api_key");

        unsafe {
            std::env::remove_var("GW_TEST_UPSTREAM_KEY");
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(GatewayConfig::load_from(Some("nonexistent_file.yaml")).is_err());
    }

    #[test]
    #[serial]
    fn test_load_config_invalid_yaml() {
        clear_overrides();
        let temp_file = write_config("invalid: yaml: content:");
        assert!(GatewayConfig::load_from(temp_file.path().to_str()).is_err());
    }

    #[test]
    #[serial]
    fn test_prefixed_env_layer() {
        clear_overrides();
        unsafe {
            std::env::set_var("GATEWAY__SERVER__PORT", "7000");
            std::env::set_var("GATEWAY__BACKGROUND_QUEUE_CAPACITY", "64");
        }

        let config = GatewayConfig::load_from(None).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.background_queue_capacity, 64);

        clear_overrides();
    }

    #[test]
    #[serial]
    fn test_env_var_overrides() {
        clear_overrides();
        unsafe {
            std::env::set_var("HOST", "192.168.1.1");
            std::env::set_var("PORT", "9999");
            std::env::set_var("VERIFY_SSL", "false");
            std::env::set_var("REQUEST_TIMEOUT_SECS", "42");
        }

        let temp_file = write_config(
            r#"
server:
  host: 127.0.0.1
  port: 8080
verify_ssl: true
"#,
        );

        let config = GatewayConfig::load_from(temp_file.path().to_str()).unwrap();

        assert_eq!(config.server.host, "192.168.1.1");
        assert_eq!(config.server.port, 9999);
        assert!(!config.verify_ssl);
        assert_eq!(config.request_timeout_secs, 42);

        clear_overrides();
    }
}
