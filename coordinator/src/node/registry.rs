//! Node registry for tracking cluster membership and health
//!
//! Reads (selection, health scoring) take the read lock; status, load and
//! heartbeat updates take the write lock.

use crate::errors::{CoordinatorError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::info::{NodeId, NodeInfo, NodeStatus};

/// Registry of every node the coordinator knows about
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node record
    pub async fn upsert(&self, node: NodeInfo) {
        let id = node.id;
        let mut nodes = self.nodes.write().await;
        let is_new = nodes.insert(id, node).is_none();
        if is_new {
            info!(node_id = %id, "Registered node");
        }
    }

    /// Record a heartbeat: refreshes last-seen and load, restores availability
    pub async fn heartbeat(&self, id: &NodeId, load: f64) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {}", id)))?;

        node.last_seen = Utc::now();
        node.load = load.clamp(0.0, 1.0);
        if node.status != NodeStatus::Available {
            debug!(node_id = %id, previous = ?node.status, "Node available again after heartbeat");
            node.status = NodeStatus::Available;
        }
        Ok(())
    }

    pub async fn set_status(&self, id: &NodeId, status: NodeStatus) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {}", id)))?;

        if node.status != status {
            info!(node_id = %id, from = ?node.status, to = ?status, "Node status changed");
            node.status = status;
        }
        Ok(())
    }

    pub async fn set_load(&self, id: &NodeId, load: f64) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {}", id)))?;
        node.load = load.clamp(0.0, 1.0);
        Ok(())
    }

    pub async fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        let nodes = self.nodes.read().await;
        nodes.get(id).cloned()
    }

    pub async fn remove(&self, id: &NodeId) -> Option<NodeInfo> {
        let mut nodes = self.nodes.write().await;
        nodes.remove(id)
    }

    /// All nodes, ordered by peer id
    pub async fn snapshot(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        let mut all: Vec<NodeInfo> = nodes.values().cloned().collect();
        all.sort_by_key(|n| n.id.to_base58());
        all
    }

    pub async fn available_nodes(&self) -> Vec<NodeInfo> {
        self.snapshot()
            .await
            .into_iter()
            .filter(NodeInfo::is_available)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Mark nodes without a heartbeat for `max_age` as unavailable
    ///
    /// Returns how many nodes changed. Nodes already unavailable are left
    /// untouched, so repeating the sweep with no new heartbeats is a no-op.
    pub async fn cleanup_stale_entries(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - max_age;

        let mut nodes = self.nodes.write().await;
        let mut changed = 0;
        for node in nodes.values_mut() {
            if node.status != NodeStatus::Unavailable && node.last_seen < cutoff {
                warn!(
                    node_id = %node.id,
                    last_seen = %node.last_seen.to_rfc3339(),
                    "Node missed heartbeats, marking unavailable"
                );
                node.status = NodeStatus::Unavailable;
                changed += 1;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let registry = NodeRegistry::new();
        let id = PeerId::random();
        registry.upsert(NodeInfo::new(id).with_load(0.4)).await;

        let node = registry.get(&id).await.unwrap();
        assert_eq!(node.load, 0.4);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_restores_availability() {
        let registry = NodeRegistry::new();
        let id = PeerId::random();
        registry
            .upsert(NodeInfo::new(id).with_status(NodeStatus::Busy))
            .await;

        registry.heartbeat(&id, 0.2).await.unwrap();

        let node = registry.get(&id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Available);
        assert_eq!(node.load, 0.2);
    }

    #[tokio::test]
    async fn test_unknown_node_errors() {
        let registry = NodeRegistry::new();
        let err = registry
            .set_status(&PeerId::random(), NodeStatus::Busy)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_available_nodes_filters_status() {
        let registry = NodeRegistry::new();
        registry.upsert(NodeInfo::new(PeerId::random())).await;
        registry
            .upsert(NodeInfo::new(PeerId::random()).with_status(NodeStatus::Unavailable))
            .await;

        assert_eq!(registry.available_nodes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_stale_entries_is_idempotent() {
        let registry = NodeRegistry::new();
        let stale = PeerId::random();
        let fresh = PeerId::random();
        registry
            .upsert(NodeInfo::new(stale).with_last_seen(Utc::now() - chrono::Duration::minutes(10)))
            .await;
        registry.upsert(NodeInfo::new(fresh)).await;

        assert_eq!(registry.cleanup_stale_entries(Duration::from_secs(60)).await, 1);
        let before = registry.snapshot().await;

        assert_eq!(registry.cleanup_stale_entries(Duration::from_secs(60)).await, 0);
        assert_eq!(registry.snapshot().await, before);

        assert_eq!(
            registry.get(&stale).await.unwrap().status,
            NodeStatus::Unavailable
        );
        assert_eq!(registry.get(&fresh).await.unwrap().status, NodeStatus::Available);
    }
}
