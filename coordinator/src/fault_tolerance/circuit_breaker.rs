//! Per-key circuit breakers
//!
//! Keys are free-form strings; nodes use [`node_key`]. A breaker opens after
//! `failure_threshold` consecutive failures, rejects work for
//! `recovery_timeout`, then admits exactly one probe. The probe's outcome
//! closes or re-opens the circuit.

use crate::errors::{CoordinatorError, Result};
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::CircuitBreakerConfig;

/// Breaker key for a node
pub fn node_key(node: &NodeId) -> String {
    format!("node:{}", node)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    last_activity: Instant,
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            opened_at: None,
            last_failure: None,
            last_activity: Instant::now(),
            probe_in_flight: false,
        }
    }

    fn recovery_elapsed(&self, recovery_timeout: Duration) -> bool {
        self.opened_at
            .map(|at| at.elapsed() >= recovery_timeout)
            .unwrap_or(true)
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probe_in_flight = false;
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Shared registry of breakers, one per key
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: RwLock<CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Breaker>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn config(&self) -> CircuitBreakerConfig {
        self.config.read().await.clone()
    }

    /// Swap thresholds; existing breaker states are kept
    pub async fn update_config(&self, config: CircuitBreakerConfig) {
        *self.config.write().await = config;
    }

    /// Admit a call for `key` or reject it with `CircuitOpen`
    ///
    /// An open breaker whose recovery timeout has elapsed moves to half-open
    /// and admits this call as its single probe.
    pub async fn try_acquire(&self, key: &str) -> Result<()> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Ok(());
        }

        let mut breakers = self.breakers.write().await;
        let Some(breaker) = breakers.get_mut(key) else {
            return Ok(());
        };
        breaker.last_activity = Instant::now();

        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open if breaker.recovery_elapsed(config.recovery_timeout) => {
                debug!(key = %key, "Circuit half-open, admitting probe");
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen if !breaker.probe_in_flight => {
                breaker.probe_in_flight = true;
                Ok(())
            }
            CircuitState::Open | CircuitState::HalfOpen => Err(CoordinatorError::CircuitOpen {
                key: key.to_string(),
            }),
        }
    }

    pub async fn record_success(&self, key: &str) {
        let mut breakers = self.breakers.write().await;
        let Some(breaker) = breakers.get_mut(key) else {
            return;
        };

        if breaker.state != CircuitState::Closed {
            info!(key = %key, "Circuit closed");
        }
        breaker.state = CircuitState::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
        breaker.probe_in_flight = false;
        breaker.last_activity = Instant::now();
    }

    pub async fn record_failure(&self, key: &str) {
        let threshold = self.config.read().await.failure_threshold;

        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(key.to_string()).or_insert_with(Breaker::new);
        breaker.consecutive_failures += 1;
        breaker.total_failures += 1;
        breaker.last_failure = Some(Utc::now());
        breaker.last_activity = Instant::now();

        match breaker.state {
            CircuitState::HalfOpen => {
                warn!(key = %key, "Probe failed, circuit re-opened");
                breaker.open();
            }
            CircuitState::Closed if breaker.consecutive_failures >= threshold => {
                warn!(
                    key = %key,
                    failures = breaker.consecutive_failures,
                    "Circuit opened"
                );
                breaker.open();
            }
            _ => {}
        }
    }

    /// Whether new work for `key` would be rejected right now
    pub async fn is_open(&self, key: &str) -> bool {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return false;
        }
        let breakers = self.breakers.read().await;
        match breakers.get(key) {
            Some(b) if b.state == CircuitState::Open => {
                !b.recovery_elapsed(config.recovery_timeout)
            }
            Some(b) if b.state == CircuitState::HalfOpen => b.probe_in_flight,
            _ => false,
        }
    }

    pub async fn state(&self, key: &str) -> CircuitState {
        let breakers = self.breakers.read().await;
        breakers
            .get(key)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Open a circuit immediately, e.g. to drain a node being healed
    pub async fn force_open(&self, key: &str) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(key.to_string()).or_insert_with(Breaker::new);
        breaker.open();
        info!(key = %key, "Circuit forced open");
    }

    pub async fn reset(&self, key: &str) {
        let mut breakers = self.breakers.write().await;
        if breakers.remove(key).is_some() {
            debug!(key = %key, "Circuit reset");
        }
    }

    pub async fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let breakers = self.breakers.read().await;
        let mut all: Vec<CircuitSnapshot> = breakers
            .iter()
            .map(|(key, b)| CircuitSnapshot {
                key: key.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
                total_failures: b.total_failures,
                last_failure: b.last_failure,
            })
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Keys currently rejecting work
    pub async fn open_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for snapshot in self.snapshot().await {
            if self.is_open(&snapshot.key).await {
                keys.push(snapshot.key);
            }
        }
        keys
    }

    /// Drop closed, failure-free breakers idle for at least `idle`
    pub async fn cleanup(&self, idle: Duration) -> usize {
        let mut breakers = self.breakers.write().await;
        let before = breakers.len();
        breakers.retain(|_, b| {
            b.state != CircuitState::Closed
                || b.consecutive_failures > 0
                || b.last_activity.elapsed() < idle
        });
        before - breakers.len()
    }

    pub async fn len(&self) -> usize {
        self.breakers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.breakers.read().await.is_empty()
    }
}
