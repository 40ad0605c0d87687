//! Business logic services for the gateway.
//!
//! This module contains the request pipeline and its collaborators:
//! upstream selection, quota accounting and pricing.

pub mod load_balancer;
pub mod pricing;
pub mod proxy_service;
pub mod quota;

// Re-export commonly used types
pub use load_balancer::{ConnectionGuard, LoadBalancer, LoadBalancerFactory, Strategy};
pub use pricing::{InMemoryPricing, PricingService};
pub use proxy_service::{Caller, Collaborators, GatewayOrchestrator, RequestMeta};
pub use quota::{InMemoryQuota, QuotaService};
