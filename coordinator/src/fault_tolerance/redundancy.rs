//! Replica count maintenance
//!
//! A replica is live while its node is reachable (available or busy). Models
//! below `default_factor` live replicas get a replication request for the
//! shortfall; the target never exceeds `max_factor`.

use crate::errors::Result;
use crate::model::ModelManager;
use crate::node::{NodeRegistry, NodeStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::config::RedundancyConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationAction {
    pub model: String,
    pub live_replicas: usize,
    pub target: usize,
    pub requested: usize,
}

pub struct RedundancyManager {
    config: RwLock<RedundancyConfig>,
    models: Arc<dyn ModelManager>,
    nodes: Arc<NodeRegistry>,
    requests: AtomicU64,
}

impl RedundancyManager {
    pub fn new(
        config: RedundancyConfig,
        models: Arc<dyn ModelManager>,
        nodes: Arc<NodeRegistry>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            models,
            nodes,
            requests: AtomicU64::new(0),
        }
    }

    pub async fn update_config(&self, config: RedundancyConfig) {
        *self.config.write().await = config;
    }

    /// Replication requests issued so far
    pub fn replication_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Compare every model against its target and request the shortfall
    pub async fn run(&self) -> Result<Vec<ReplicationAction>> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Ok(Vec::new());
        }
        let target = config.default_factor.min(config.max_factor) as usize;

        let reachable: HashSet<_> = self
            .nodes
            .snapshot()
            .await
            .into_iter()
            .filter(|n| n.status != NodeStatus::Unavailable)
            .map(|n| n.id)
            .collect();

        let mut actions = Vec::new();
        for model in self.models.list_models().await? {
            let live = model
                .replicas
                .iter()
                .filter(|r| reachable.contains(*r))
                .count();
            if live >= target {
                continue;
            }

            let requested = target - live;
            if let Err(e) = self.models.request_replication(&model.name, requested).await {
                warn!(model = %model.name, error = %e, "Replication request failed");
                continue;
            }
            self.requests.fetch_add(1, Ordering::Relaxed);
            info!(
                model = %model.name,
                live_replicas = live,
                target = target,
                requested = requested,
                "Model under-replicated"
            );
            actions.push(ReplicationAction {
                model: model.name,
                live_replicas: live,
                target,
                requested,
            });
        }
        Ok(actions)
    }
}
