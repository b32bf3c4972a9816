//! Node selection for a model
//!
//! Candidates must host a replica of the model, be `Available`, and not sit
//! behind an open circuit. They are ranked by ascending load, then by the
//! freshest heartbeat, then by peer id, so an unchanged registry always
//! yields the same ordered selection.

use crate::errors::{CoordinatorError, Result};
use crate::fault_tolerance::circuit_breaker::{node_key, CircuitBreakerRegistry};
use crate::model::ModelManager;
use crate::node::{NodeId, NodeInfo, NodeRegistry};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

pub struct NodeSelector {
    nodes: Arc<NodeRegistry>,
    models: Arc<dyn ModelManager>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    load_balancing: bool,
}

impl NodeSelector {
    pub fn new(nodes: Arc<NodeRegistry>, models: Arc<dyn ModelManager>) -> Self {
        Self {
            nodes,
            models,
            breakers: None,
            load_balancing: true,
        }
    }

    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// With load balancing off, ranking skips the load comparison
    pub fn with_load_balancing(mut self, enabled: bool) -> Self {
        self.load_balancing = enabled;
        self
    }

    /// Every eligible node for `model`, best first
    pub async fn candidates(&self, model: &str) -> Vec<NodeInfo> {
        let replicas = match self.models.get_model(model).await {
            Ok(info) => info.replicas,
            Err(e) => {
                debug!(model = %model, error = %e, "Model lookup failed, no candidates");
                Vec::new()
            }
        };

        let mut candidates = Vec::new();
        for node in self.nodes.available_nodes().await {
            if !replicas.contains(&node.id) {
                continue;
            }
            if let Some(breakers) = &self.breakers {
                if breakers.is_open(&node_key(&node.id)).await {
                    debug!(node_id = %node.id, "Skipping node with open circuit");
                    continue;
                }
            }
            candidates.push(node);
        }

        let load_balancing = self.load_balancing;
        candidates.sort_by(|a, b| rank(a, b, load_balancing));
        candidates
    }

    /// Pick the `min_required` best nodes for `model`
    pub async fn select(&self, model: &str, min_required: usize) -> Result<Vec<NodeId>> {
        let candidates = self.candidates(model).await;
        if candidates.len() < min_required {
            return Err(CoordinatorError::InsufficientAvailableNodes {
                required: min_required,
                available: candidates.len(),
            });
        }

        let selected: Vec<NodeId> = candidates
            .iter()
            .take(min_required)
            .map(|n| n.id)
            .collect();
        debug!(model = %model, selected = selected.len(), eligible = candidates.len(), "Selected nodes");
        Ok(selected)
    }
}

fn rank(a: &NodeInfo, b: &NodeInfo, load_balancing: bool) -> Ordering {
    let by_load = if load_balancing {
        a.load.total_cmp(&b.load)
    } else {
        Ordering::Equal
    };
    by_load
        .then_with(|| b.last_seen.cmp(&a.last_seen))
        .then_with(|| a.id.to_base58().cmp(&b.id.to_base58()))
}
