use chrono::{DateTime, Utc};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};

/// Nodes are identified by their libp2p peer id.
pub type NodeId = PeerId;

/// Routing status advertised for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Accepting partition work
    Available,
    /// Reachable but should not receive new work
    Busy,
    /// Unreachable or failed
    Unavailable,
}

/// Hardware and model capabilities a node advertises.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Model names this node can serve
    pub supported_models: Vec<String>,

    /// Largest model the node can hold, in bytes
    pub max_model_size: u64,

    /// Relative compute capacity (arbitrary units)
    pub compute_capacity: f64,

    /// Memory available for model weights, in bytes
    pub memory_capacity: u64,

    /// Network bandwidth in megabits per second
    pub network_bandwidth: f64,
}

/// Last known state of a cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub capabilities: NodeCapabilities,

    /// Utilisation in `0.0..=1.0`
    pub load: f64,

    pub last_seen: DateTime<Utc>,
    pub status: NodeStatus,
}

impl NodeInfo {
    /// A freshly seen, idle, available node.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            capabilities: NodeCapabilities::default(),
            load: 0.0,
            last_seen: Utc::now(),
            status: NodeStatus::Available,
        }
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.load = load.clamp(0.0, 1.0);
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn with_capabilities(mut self, capabilities: NodeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Available
    }
}
