//! Provider abstraction and the registry that resolves providers by name.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::adapter::Adapter;
use crate::core::error::{AppError, Result};
use crate::store::Credential;

/// A credential-backed upstream family (for example `kiro`).
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Exchange the credential's refresh token for a new access token and
    /// update it in place. The caller persists the result.
    async fn refresh_token(&self, credential: &mut Credential) -> Result<()>;

    /// Cheap local check. Errors with
    /// [`AppError::CredentialUnhealthy`] describing the problem.
    async fn check_health(&self, credential: &Credential) -> Result<()>;

    fn create_adapter(&self, credential: &Credential) -> Result<Arc<dyn Adapter>>;

    fn as_oauth(&self) -> Option<&dyn OAuthProvider> {
        None
    }

    fn as_device_code(&self) -> Option<&dyn DeviceCodeProvider> {
        None
    }
}

/// Browser-redirect OAuth capability.
pub trait OAuthProvider: Send + Sync {
    fn auth_url(&self, state: &str) -> String;
}

/// OAuth device-code capability.
#[async_trait]
pub trait DeviceCodeProvider: Send + Sync {
    /// Register a client and request a device authorization.
    async fn initiate_device_code(&self) -> Result<DeviceAuthorization>;

    /// One token exchange attempt for a pending authorization.
    async fn exchange_device_code(&self, authorization: &DeviceAuthorization) -> Result<TokenPoll>;
}

/// Everything needed to show the user a code and to poll for the token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    /// Seconds until the device code expires
    pub expires_in: u64,
    /// Seconds between polls
    pub interval: u64,
    #[serde(skip_serializing)]
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub region: String,
}

/// Result of one device-code token exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenPoll {
    /// `authorization_pending`
    Pending,
    /// `slow_down`
    SlowDown,
    Granted(TokenGrant),
    /// Terminal error such as `access_denied` or `expired_token`
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Providers by name. Built once at startup and shared behind an `Arc`.
#[derive(Default)]
pub struct Registry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one with the same name.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        if providers.insert(name.clone(), provider).is_some() {
            tracing::warn!(provider = %name, "Replacing registered provider");
        } else {
            tracing::info!(provider = %name, "Registered provider");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        providers
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::ProviderNotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let providers = self.providers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = providers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Provider for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn refresh_token(&self, _credential: &mut Credential) -> Result<()> {
            Ok(())
        }

        async fn check_health(&self, _credential: &Credential) -> Result<()> {
            Ok(())
        }

        fn create_adapter(&self, _credential: &Credential) -> Result<Arc<dyn Adapter>> {
            Err(AppError::AdapterCreation("unused".into()))
        }
    }

    #[test]
    fn test_register_get_list() {
        let registry = Registry::new();
        registry.register(Arc::new(Named("zeta")));
        registry.register(Arc::new(Named("alpha")));

        assert_eq!(registry.get("zeta").unwrap().name(), "zeta");
        assert_eq!(registry.list(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_unknown_provider() {
        let registry = Registry::new();
        match registry.get("missing") {
            Err(AppError::ProviderNotFound(name)) => assert_eq!(name, "missing"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_capabilities_default_to_none() {
        let provider = Named("plain");
        assert!(provider.as_oauth().is_none());
        assert!(provider.as_device_code().is_none());
    }
}
