//! Self-healing
//!
//! Strategies are tried best-first until one succeeds. Ranking is
//! `priority / 10 * success_rate`; success rates move with observed
//! outcomes, but only when the learning loop runs, so one healing cycle
//! always ranks consistently.

use crate::errors::{CoordinatorError, Result};
use crate::model::ModelManager;
use crate::node::{NodeId, NodeInfo, NodeRegistry, NodeStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::circuit_breaker::{node_key, CircuitBreakerRegistry};
use super::config::SelfHealingConfig;
use super::performance::PerformanceSummary;

const SUCCESS_WEIGHT: f64 = 0.7;
const LOAD_WEIGHT: f64 = 0.3;
const LEARNING_DECAY: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStrategyKind {
    ServiceRestart,
    ResourceReallocation,
    LoadRedistribution,
    Failover,
    Scaling,
}

impl HealingStrategyKind {
    pub const ALL: [HealingStrategyKind; 5] = [
        HealingStrategyKind::ServiceRestart,
        HealingStrategyKind::ResourceReallocation,
        HealingStrategyKind::LoadRedistribution,
        HealingStrategyKind::Failover,
        HealingStrategyKind::Scaling,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealingStrategyKind::ServiceRestart => "service_restart",
            HealingStrategyKind::ResourceReallocation => "resource_reallocation",
            HealingStrategyKind::LoadRedistribution => "load_redistribution",
            HealingStrategyKind::Failover => "failover",
            HealingStrategyKind::Scaling => "scaling",
        }
    }

    pub fn priority(&self) -> u32 {
        match self {
            HealingStrategyKind::ServiceRestart => 7,
            HealingStrategyKind::ResourceReallocation => 6,
            HealingStrategyKind::LoadRedistribution => 5,
            HealingStrategyKind::Failover => 9,
            HealingStrategyKind::Scaling => 4,
        }
    }

    pub fn initial_success_rate(&self) -> f64 {
        match self {
            HealingStrategyKind::ServiceRestart => 0.8,
            HealingStrategyKind::ResourceReallocation => 0.75,
            HealingStrategyKind::LoadRedistribution => 0.85,
            HealingStrategyKind::Failover => 0.9,
            HealingStrategyKind::Scaling => 0.7,
        }
    }

    pub fn is_enabled(&self, config: &SelfHealingConfig) -> bool {
        match self {
            HealingStrategyKind::ServiceRestart => config.service_restart,
            HealingStrategyKind::ResourceReallocation => config.resource_reallocation,
            HealingStrategyKind::LoadRedistribution => config.load_redistribution,
            HealingStrategyKind::Failover => config.enable_failover,
            HealingStrategyKind::Scaling => config.enable_scaling,
        }
    }
}

/// Health in `[0, 1]`: mostly call success, partly spare capacity
pub fn health_score(node: &NodeInfo, performance: Option<&PerformanceSummary>) -> f64 {
    if node.status == NodeStatus::Unavailable {
        return 0.0;
    }
    let success = performance.map(|p| p.success_rate).unwrap_or(1.0);
    SUCCESS_WEIGHT * success + LOAD_WEIGHT * (1.0 - node.load.clamp(0.0, 1.0))
}

/// Carries out healing actions against the cluster
#[async_trait]
pub trait HealingActuator: Send + Sync {
    async fn apply(&self, strategy: HealingStrategyKind, node: &NodeId) -> Result<()>;
}

/// Heals by steering the node registry, breakers and model placement
pub struct RegistryActuator {
    nodes: Arc<NodeRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    models: Arc<dyn ModelManager>,
}

impl RegistryActuator {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        models: Arc<dyn ModelManager>,
    ) -> Self {
        Self {
            nodes,
            breakers,
            models,
        }
    }

    async fn node(&self, id: &NodeId) -> Result<NodeInfo> {
        self.nodes
            .get(id)
            .await
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {}", id)))
    }

    async fn has_other_available(&self, id: &NodeId) -> bool {
        self.nodes
            .available_nodes()
            .await
            .iter()
            .any(|n| n.id != *id)
    }

    async fn models_on(&self, id: &NodeId) -> Result<Vec<String>> {
        Ok(self
            .models
            .list_models()
            .await?
            .into_iter()
            .filter(|m| m.hosted_on(id))
            .map(|m| m.name)
            .collect())
    }
}

#[async_trait]
impl HealingActuator for RegistryActuator {
    async fn apply(&self, strategy: HealingStrategyKind, id: &NodeId) -> Result<()> {
        let node = self.node(id).await?;

        match strategy {
            HealingStrategyKind::ServiceRestart => {
                if node.status == NodeStatus::Unavailable {
                    return Err(CoordinatorError::Healing(format!(
                        "node {} is unreachable",
                        id
                    )));
                }
                self.breakers.reset(&node_key(id)).await;
                self.nodes.set_status(id, NodeStatus::Available).await
            }
            HealingStrategyKind::ResourceReallocation => {
                if node.status == NodeStatus::Unavailable {
                    return Err(CoordinatorError::Healing(format!(
                        "node {} is unreachable",
                        id
                    )));
                }
                // Busy nodes take no new partitions until their next heartbeat
                self.nodes.set_status(id, NodeStatus::Busy).await
            }
            HealingStrategyKind::LoadRedistribution => {
                if !self.has_other_available(id).await {
                    return Err(CoordinatorError::Healing(
                        "no other available node to take load".to_string(),
                    ));
                }
                self.breakers.force_open(&node_key(id)).await;
                Ok(())
            }
            HealingStrategyKind::Failover => {
                if !self.has_other_available(id).await {
                    return Err(CoordinatorError::Healing(
                        "no available node to fail over to".to_string(),
                    ));
                }
                self.nodes.set_status(id, NodeStatus::Unavailable).await?;
                for model in self.models_on(id).await? {
                    self.models.request_replication(&model, 1).await?;
                }
                Ok(())
            }
            HealingStrategyKind::Scaling => {
                let models = self.models_on(id).await?;
                if models.is_empty() {
                    return Err(CoordinatorError::Healing(format!(
                        "node {} hosts no models to scale",
                        id
                    )));
                }
                for model in models {
                    self.models.request_replication(&model, 1).await?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingAttempt {
    pub id: String,
    pub node_id: String,
    pub strategy: HealingStrategyKind,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub strategy: HealingStrategyKind,
    pub priority: u32,
    pub success_rate: f64,
    pub attempts: u64,
    pub successes: u64,
}

impl StrategyStats {
    pub fn rank(&self) -> f64 {
        self.priority as f64 / 10.0 * self.success_rate
    }
}

pub struct SelfHealer {
    config: RwLock<SelfHealingConfig>,
    action_timeout: RwLock<Duration>,
    actuator: Arc<dyn HealingActuator>,
    strategies: RwLock<BTreeMap<HealingStrategyKind, StrategyStats>>,
    /// Outcomes not yet folded into success rates
    pending: RwLock<Vec<(HealingStrategyKind, bool)>>,
    history: RwLock<Vec<HealingAttempt>>,
    attempts: AtomicU64,
    successful: AtomicU64,
    total_healing_ms: AtomicU64,
}

impl SelfHealer {
    pub fn new(
        config: SelfHealingConfig,
        action_timeout: Duration,
        actuator: Arc<dyn HealingActuator>,
    ) -> Self {
        let strategies = HealingStrategyKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    StrategyStats {
                        strategy: *kind,
                        priority: kind.priority(),
                        success_rate: kind.initial_success_rate(),
                        attempts: 0,
                        successes: 0,
                    },
                )
            })
            .collect();

        Self {
            config: RwLock::new(config),
            action_timeout: RwLock::new(action_timeout),
            actuator,
            strategies: RwLock::new(strategies),
            pending: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            attempts: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            total_healing_ms: AtomicU64::new(0),
        }
    }

    pub async fn update_config(&self, config: SelfHealingConfig, action_timeout: Duration) {
        *self.config.write().await = config;
        *self.action_timeout.write().await = action_timeout;
    }

    pub async fn threshold(&self) -> f64 {
        self.config.read().await.healing_threshold
    }

    /// Enabled strategies, best first
    pub async fn ranked_strategies(&self) -> Vec<StrategyStats> {
        let config = self.config.read().await.clone();
        let strategies = self.strategies.read().await;
        let mut ranked: Vec<StrategyStats> = strategies
            .values()
            .filter(|s| s.strategy.is_enabled(&config))
            .cloned()
            .collect();
        ranked.sort_by(|a, b| {
            b.rank()
                .total_cmp(&a.rank())
                .then_with(|| b.priority.cmp(&a.priority))
        });
        ranked
    }

    pub async fn strategy_stats(&self) -> Vec<StrategyStats> {
        self.strategies.read().await.values().cloned().collect()
    }

    /// Try strategies best-first until one succeeds
    pub async fn heal(&self, node: &NodeId, reason: &str) -> Result<HealingStrategyKind> {
        let timeout = *self.action_timeout.read().await;
        let started = Instant::now();
        info!(node_id = %node, reason = %reason, "Healing node");

        for candidate in self.ranked_strategies().await {
            let strategy = candidate.strategy;
            let attempt_started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, self.actuator.apply(strategy, node)).await {
                Ok(result) => result,
                Err(_) => Err(CoordinatorError::Timeout(timeout)),
            };
            self.record_attempt(node, strategy, attempt_started.elapsed(), &outcome)
                .await;

            match outcome {
                Ok(()) => {
                    self.successful.fetch_add(1, Ordering::Relaxed);
                    self.total_healing_ms
                        .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    info!(
                        node_id = %node,
                        strategy = strategy.as_str(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Node healed"
                    );
                    return Ok(strategy);
                }
                Err(e) => {
                    warn!(
                        node_id = %node,
                        strategy = strategy.as_str(),
                        error = %e,
                        "Healing strategy failed"
                    );
                }
            }
        }

        Err(CoordinatorError::Healing(format!(
            "every enabled strategy failed for node {}",
            node
        )))
    }

    async fn record_attempt(
        &self,
        node: &NodeId,
        strategy: HealingStrategyKind,
        duration: Duration,
        outcome: &Result<()>,
    ) {
        let success = outcome.is_ok();
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(stats) = self.strategies.write().await.get_mut(&strategy) {
            stats.attempts += 1;
            if success {
                stats.successes += 1;
            }
        }
        self.pending.write().await.push((strategy, success));
        self.history.write().await.push(HealingAttempt {
            id: format!("heal_{}", Uuid::new_v4().simple()),
            node_id: node.to_string(),
            strategy,
            started_at: Utc::now(),
            duration,
            success,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });
    }

    /// Fold pending outcomes into success rates
    ///
    /// Returns how many outcomes were applied; none are while learning is
    /// disabled.
    pub async fn learn(&self) -> usize {
        if !self.config.read().await.enable_learning {
            return 0;
        }
        let outcomes = std::mem::take(&mut *self.pending.write().await);
        if outcomes.is_empty() {
            return 0;
        }

        let mut strategies = self.strategies.write().await;
        for (strategy, success) in &outcomes {
            if let Some(stats) = strategies.get_mut(strategy) {
                let bonus = if *success { 1.0 - LEARNING_DECAY } else { 0.0 };
                stats.success_rate = stats.success_rate * LEARNING_DECAY + bonus;
                debug!(
                    strategy = strategy.as_str(),
                    success_rate = stats.success_rate,
                    "Strategy weight updated"
                );
            }
        }
        outcomes.len()
    }

    pub async fn pending_outcomes(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn history(&self) -> Vec<HealingAttempt> {
        self.history.read().await.clone()
    }

    /// Forget attempts older than `retention`
    pub async fn cleanup_history(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;
        let mut history = self.history.write().await;
        let before = history.len();
        history.retain(|a| a.started_at > cutoff);
        before - history.len()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    /// Mean time from starting a heal to its first successful strategy
    pub fn average_healing_time(&self) -> Duration {
        match self.successful() {
            0 => Duration::ZERO,
            n => Duration::from_millis(self.total_healing_ms.load(Ordering::Relaxed) / n),
        }
    }
}
