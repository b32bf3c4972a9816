use crate::errors::Result;
use crate::node::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A model known to the cluster and the peers holding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name (e.g. "llama-3-8b")
    pub name: String,

    /// Where the weights were registered from
    pub source_path: String,

    /// Number of transformer layers, when known
    pub layer_count: Option<u32>,

    /// Total size in bytes
    pub size_bytes: u64,

    /// Peers hosting a replica
    pub replicas: Vec<NodeId>,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
            layer_count: None,
            size_bytes: 0,
            replicas: Vec::new(),
        }
    }

    pub fn with_layers(mut self, layer_count: u32) -> Self {
        self.layer_count = Some(layer_count);
        self
    }

    pub fn with_replicas(mut self, replicas: Vec<NodeId>) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn hosted_on(&self, node: &NodeId) -> bool {
        self.replicas.contains(node)
    }
}

/// Narrow contract the coordinator needs from model storage.
#[async_trait]
pub trait ModelManager: Send + Sync {
    /// Look up a model by name
    async fn get_model(&self, name: &str) -> Result<ModelInfo>;

    /// Register a model for distribution
    async fn add_model(&self, name: &str, source_path: &str) -> Result<ModelInfo>;

    /// Every registered model
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Ask for `additional` more replicas of a model
    async fn request_replication(&self, name: &str, additional: usize) -> Result<()>;
}
