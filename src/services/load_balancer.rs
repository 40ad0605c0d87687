//! Upstream selection strategies.
//!
//! A [`LoadBalancer`] picks one [`UpstreamConfig`] from the candidates that
//! advertise the requested model. Balancers are cached per `(model, strategy)`
//! by [`LoadBalancerFactory`] so their counters survive across requests.

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::error::{AppError, Result};
use crate::store::models::UpstreamConfig;

// ============================================================================
// Strategy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
}

impl Strategy {
    /// Resolve a strategy name. Unknown names fall back to round robin.
    pub fn parse(name: &str) -> Self {
        match name {
            "weighted_round_robin" => Strategy::WeightedRoundRobin,
            "least_connections" => Strategy::LeastConnections,
            "random" => Strategy::Random,
            _ => Strategy::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Trait
// ============================================================================

pub trait LoadBalancer: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Pick one candidate. Fails with [`AppError::NoAvailableConfig`] on an
    /// empty slice.
    fn select_config(&self, candidates: &[UpstreamConfig]) -> Result<UpstreamConfig>;

    /// Signal that a call routed to `config_id` finished. Only meaningful for
    /// connection-counting strategies.
    fn release_connection(&self, _config_id: &str) {}
}

// ============================================================================
// Round robin
// ============================================================================

#[derive(Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn strategy(&self) -> Strategy {
        Strategy::RoundRobin
    }

    fn select_config(&self, candidates: &[UpstreamConfig]) -> Result<UpstreamConfig> {
        if candidates.is_empty() {
            return Err(AppError::NoAvailableConfig);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].clone())
    }
}

// ============================================================================
// Weighted round robin
// ============================================================================

/// Walks a virtual ring where each candidate occupies `weight` slots.
#[derive(Default)]
pub struct WeightedRoundRobinBalancer {
    position: Mutex<u64>,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn strategy(&self) -> Strategy {
        Strategy::WeightedRoundRobin
    }

    fn select_config(&self, candidates: &[UpstreamConfig]) -> Result<UpstreamConfig> {
        if candidates.is_empty() {
            return Err(AppError::NoAvailableConfig);
        }

        let total: u64 = candidates.iter().map(|c| c.effective_weight()).sum();
        let position = {
            let mut counter = self.position.lock().unwrap_or_else(|e| e.into_inner());
            let current = *counter;
            *counter = counter.wrapping_add(1);
            current % total
        };

        let mut cumulative = 0u64;
        let chosen = candidates
            .iter()
            .find(|c| {
                cumulative += c.effective_weight();
                position < cumulative
            })
            .unwrap_or(&candidates[0]);

        let mut selected = chosen.clone();
        selected.weight = selected.effective_weight() as i32;
        Ok(selected)
    }
}

// ============================================================================
// Least connections
// ============================================================================

/// Tracks in-flight calls per config id. Counters live as long as the balancer.
#[derive(Default)]
pub struct LeastConnectionsBalancer {
    connections: RwLock<HashMap<String, u64>>,
}

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight count for `config_id` (0 if never seen).
    pub fn connections(&self, config_id: &str) -> u64 {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(config_id)
            .copied()
            .unwrap_or(0)
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn strategy(&self) -> Strategy {
        Strategy::LeastConnections
    }

    fn select_config(&self, candidates: &[UpstreamConfig]) -> Result<UpstreamConfig> {
        if candidates.is_empty() {
            return Err(AppError::NoAvailableConfig);
        }

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());

        // First minimum wins, so ties go to the earlier candidate.
        let mut selected = &candidates[0];
        let mut min = u64::MAX;
        for candidate in candidates {
            let count = *connections.entry(candidate.id.clone()).or_insert(0);
            if count < min {
                min = count;
                selected = candidate;
            }
        }

        if let Some(count) = connections.get_mut(&selected.id) {
            *count += 1;
        }
        Ok(selected.clone())
    }

    fn release_connection(&self, config_id: &str) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = connections.get_mut(config_id) {
            *count = count.saturating_sub(1);
        }
    }
}

// ============================================================================
// Random
// ============================================================================

pub struct RandomBalancer {
    rng: Mutex<StdRng>,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence, for tests and benchmarks.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RandomBalancer {
    fn strategy(&self) -> Strategy {
        Strategy::Random
    }

    fn select_config(&self, candidates: &[UpstreamConfig]) -> Result<UpstreamConfig> {
        if candidates.is_empty() {
            return Err(AppError::NoAvailableConfig);
        }
        let index = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0..candidates.len())
        };
        Ok(candidates[index].clone())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build a fresh balancer for `strategy`.
pub fn create_balancer(strategy: Strategy) -> Arc<dyn LoadBalancer> {
    match strategy {
        Strategy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        Strategy::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new()),
        Strategy::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
        Strategy::Random => Arc::new(RandomBalancer::new()),
    }
}

/// Hands out one long-lived balancer per `(model, strategy)`.
#[derive(Default)]
pub struct LoadBalancerFactory {
    balancers: DashMap<(String, Strategy), Arc<dyn LoadBalancer>>,
}

impl LoadBalancerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &str, strategy_name: &str) -> Arc<dyn LoadBalancer> {
        let strategy = Strategy::parse(strategy_name);
        self.balancers
            .entry((model.to_string(), strategy))
            .or_insert_with(|| {
                tracing::debug!(model = %model, strategy = %strategy, "Creating load balancer");
                create_balancer(strategy)
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }
}

// ============================================================================
// Connection guard
// ============================================================================

/// Calls [`LoadBalancer::release_connection`] when dropped.
///
/// The orchestrator holds one per dispatched call; for streams it moves into
/// the relay so the slot is released when the relay ends.
pub struct ConnectionGuard {
    balancer: Arc<dyn LoadBalancer>,
    config_id: String,
}

impl ConnectionGuard {
    pub fn new(balancer: Arc<dyn LoadBalancer>, config_id: impl Into<String>) -> Self {
        Self {
            balancer,
            config_id: config_id.into(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.balancer.release_connection(&self.config_id);
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("config_id", &self.config_id)
            .finish()
    }
}
