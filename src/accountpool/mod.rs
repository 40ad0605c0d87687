//! Credential pools for providers that authenticate with rotating OAuth
//! tokens instead of a static API key.
//!
//! - [`provider`]: the `Provider` trait, its optional capabilities and the [`Registry`]
//! - [`pool`]: credential selection and refresh
//! - [`device_code`]: device-code login sessions
//! - [`maintenance`]: periodic health and refresh sweeps
//! - [`kiro`]: the Kiro provider

pub mod device_code;
pub mod kiro;
pub mod maintenance;
pub mod pool;
pub mod provider;

pub use device_code::{DeviceCodeSessions, SessionState};
pub use maintenance::{HealthSummary, PoolMaintenance};
pub use pool::{CredentialPool, HealthReport, Lease, RefreshSummary};
pub use provider::{
    DeviceAuthorization, DeviceCodeProvider, OAuthProvider, Provider, Registry, TokenGrant,
    TokenPoll,
};
