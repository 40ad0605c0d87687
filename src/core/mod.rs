//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Logging and metrics
//! - The background work queue and request log sinks

pub mod config;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod metrics;
pub mod request_logger;
pub mod task_queue;

// Re-export commonly used types
pub use config::{GatewayConfig, ServerConfig};
pub use error::{AppError, Result};
pub use logging::{generate_request_id, get_request_id, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use request_logger::{RequestLogRecord, RequestLogSink};
pub use task_queue::BackgroundQueue;
