//! In-process model manager
//!
//! `ModelRegistry` keeps model records in memory and, when given a storage
//! directory, persists them as `models.json` after every change. Replication
//! requests are queued for whatever process actually copies weights; the
//! queue can be drained with [`ModelRegistry::take_replication_requests`].

use crate::errors::{CoordinatorError, Result};
use crate::node::NodeId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::manager::{ModelInfo, ModelManager};

/// Registry of models and replica placement
#[derive(Debug, Default)]
pub struct ModelRegistry {
    /// Directory for `models.json`, `None` keeps everything in memory
    storage_path: Option<PathBuf>,

    models: RwLock<HashMap<String, ModelInfo>>,

    /// Outstanding replication requests by model name
    replication_requests: RwLock<HashMap<String, usize>>,
}

impl ModelRegistry {
    /// Memory-only registry
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Registry persisted under `storage_path`
    pub fn new(storage_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&storage_path)?;

        Ok(Self {
            storage_path: Some(storage_path),
            ..Self::default()
        })
    }

    /// Create with default storage path (`~/.meshnet/models`)
    pub fn with_defaults() -> Result<Self> {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".meshnet")
            .join("models");
        Self::new(path)
    }

    /// Load registry state from disk
    pub async fn load(&self) -> Result<()> {
        let Some(file) = self.registry_file() else {
            return Ok(());
        };

        if !file.exists() {
            debug!("No existing model registry file found");
            return Ok(());
        }

        let data = std::fs::read_to_string(&file)?;
        let entries: HashMap<String, ModelInfo> = serde_json::from_str(&data)?;

        let mut models = self.models.write().await;
        *models = entries;

        info!(count = models.len(), "Loaded model registry");
        Ok(())
    }

    /// Save registry state to disk
    pub async fn save(&self) -> Result<()> {
        let Some(file) = self.registry_file() else {
            return Ok(());
        };

        let models = self.models.read().await;
        let data = serde_json::to_string_pretty(&*models)?;

        std::fs::write(&file, data)?;
        debug!("Saved model registry");
        Ok(())
    }

    /// Insert a fully described model
    pub async fn register(&self, model: ModelInfo) -> Result<()> {
        let name = model.name.clone();
        {
            let mut models = self.models.write().await;
            models.insert(name.clone(), model);
        }
        info!(model = %name, "Registered model");
        self.save().await
    }

    /// Record that `node` now hosts a replica of `name`
    pub async fn add_replica(&self, name: &str, node: NodeId) -> Result<()> {
        {
            let mut models = self.models.write().await;
            let model = models
                .get_mut(name)
                .ok_or_else(|| CoordinatorError::NotFound(format!("model {}", name)))?;
            if !model.replicas.contains(&node) {
                model.replicas.push(node);
            }
        }
        self.fulfil_replication(name).await;
        self.save().await
    }

    /// Forget the replica of `name` on `node`
    pub async fn remove_replica(&self, name: &str, node: &NodeId) -> Result<()> {
        {
            let mut models = self.models.write().await;
            let model = models
                .get_mut(name)
                .ok_or_else(|| CoordinatorError::NotFound(format!("model {}", name)))?;
            model.replicas.retain(|r| r != node);
        }
        self.save().await
    }

    /// Outstanding replica count requested for a model
    pub async fn pending_replication(&self, name: &str) -> usize {
        let requests = self.replication_requests.read().await;
        requests.get(name).copied().unwrap_or(0)
    }

    /// Drain all outstanding replication requests
    pub async fn take_replication_requests(&self) -> HashMap<String, usize> {
        let mut requests = self.replication_requests.write().await;
        std::mem::take(&mut *requests)
    }

    async fn fulfil_replication(&self, name: &str) {
        let mut requests = self.replication_requests.write().await;
        if let Some(pending) = requests.get_mut(name) {
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                requests.remove(name);
            }
        }
    }

    fn registry_file(&self) -> Option<PathBuf> {
        self.storage_path.as_ref().map(|p| p.join("models.json"))
    }
}

#[async_trait]
impl ModelManager for ModelRegistry {
    async fn get_model(&self, name: &str) -> Result<ModelInfo> {
        let models = self.models.read().await;
        models
            .get(name)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(format!("model {}", name)))
    }

    async fn add_model(&self, name: &str, source_path: &str) -> Result<ModelInfo> {
        let model = {
            let mut models = self.models.write().await;
            models
                .entry(name.to_string())
                .or_insert_with(|| ModelInfo::new(name, source_path))
                .clone()
        };
        info!(model = %name, source = %source_path, "Added model for distribution");
        self.save().await?;
        Ok(model)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let models = self.models.read().await;
        let mut all: Vec<ModelInfo> = models.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn request_replication(&self, name: &str, additional: usize) -> Result<()> {
        if !self.models.read().await.contains_key(name) {
            return Err(CoordinatorError::NotFound(format!("model {}", name)));
        }
        if additional == 0 {
            return Ok(());
        }

        let mut requests = self.replication_requests.write().await;
        let pending = requests.entry(name.to_string()).or_insert(0);
        // Repeated requests replace rather than stack
        *pending = (*pending).max(additional);
        info!(model = %name, additional = additional, "Replication requested");
        Ok(())
    }
}
