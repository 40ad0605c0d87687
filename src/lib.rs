//! LLM Gateway - a multi-protocol front door for LLM APIs
//!
//! Clients speak OpenAI, Anthropic or Gemini; the gateway authenticates the
//! caller, checks quota, picks an upstream with a per-model load balancing
//! strategy and forwards the call in the upstream's own protocol.
//!
//! - **Protocol codecs**: one decoder/encoder per client protocol
//! - **Load balancing**: round robin, weighted round robin, least connections and random
//! - **Credential pools**: rotating OAuth credentials with background refresh
//! - **Device-code login**: adds pool credentials without a browser redirect
//! - **Streaming**: Server-Sent Events relayed as they arrive
//!
//! # Architecture
//!
//! - [`core`]: config, errors, logging, metrics, background queue
//! - [`protocol`]: canonical request/response model and client codecs
//! - [`store`]: records and the store traits with in-memory implementations
//! - [`services`]: load balancing, quota, pricing and the request pipeline
//! - [`adapter`]: upstream clients
//! - [`accountpool`]: providers, credential pools and device-code sessions
//! - [`api`]: HTTP handlers and the router
//!
//! # Configuration
//!
//! See [`core::config`]. Optional environment variables:
//! - `GATEWAY_CONFIG`: YAML config file (default: gateway.yaml)
//! - `HOST`: Server bind address (default: 0.0.0.0)
//! - `PORT`: Server port (default: 18000)
//! - `VERIFY_SSL`: Verify SSL certificates for upstream (default: true)
//! - `REQUEST_TIMEOUT_SECS`: Request timeout in seconds (default: 300)

pub mod accountpool;
pub mod adapter;
pub mod api;
pub mod core;
pub mod gateway;
pub mod protocol;
pub mod services;
pub mod store;

// Re-export commonly used types for convenience
pub use api::AppState;
pub use core::{AppError, GatewayConfig, Result};
pub use gateway::Gateway;
pub use services::GatewayOrchestrator;
