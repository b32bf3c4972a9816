//! Coordinator configuration
//!
//! One document carries both the engine settings and the fault-tolerance
//! policy. Files ending in `.yaml`/`.yml` are read as YAML, anything else as
//! TOML. Loading always validates; an invalid document is never returned.
//!
//! ```toml
//! [engine]
//! min_nodes_required = 2
//! inference_timeout = "5m"
//! partition_strategy = "layerwise"
//!
//! [fault_tolerance.self_healing]
//! healing_interval = "1m"
//! monitoring_interval = "10s"
//! ```

pub mod duration_format;

use crate::errors::{CoordinatorError, Result, ValidationError, ValidationErrors};
use crate::fault_tolerance::FaultToleranceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Settings for the `pipeline_parallel` partition strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tokens per input chunk
    pub chunk_size: usize,
    /// Tokens shared between consecutive chunks
    pub overlap: usize,
    /// Layer stages each chunk is additionally split into
    pub layer_stages: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap: 32,
            layer_stages: 1,
        }
    }
}

/// Distributed inference engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_inferences: usize,
    #[serde(with = "duration_format")]
    pub inference_timeout: Duration,
    pub partition_strategy: String,
    pub aggregation_strategy: String,
    pub min_nodes_required: usize,
    pub load_balancing: bool,
    pub fault_tolerance: bool,
    /// Layer count assumed when neither the model nor the request names one
    pub default_layer_count: u32,
    /// Directory new models are registered from
    pub model_source_dir: String,
    pub pipeline: PipelineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_inferences: 10,
            inference_timeout: Duration::from_secs(300),
            partition_strategy: "layerwise".to_string(),
            aggregation_strategy: "concat".to_string(),
            min_nodes_required: 2,
            load_balancing: true,
            fault_tolerance: true,
            default_layer_count: 32,
            model_source_dir: "/tmp/models".to_string(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_min_nodes(mut self, min_nodes: usize) -> Self {
        self.min_nodes_required = min_nodes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout = timeout;
        self
    }

    pub fn with_partition_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.partition_strategy = strategy.into();
        self
    }

    pub fn with_aggregation_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.aggregation_strategy = strategy.into();
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn violations(&self) -> ValidationErrors {
        let mut errs = ValidationErrors::default();

        if self.max_concurrent_inferences == 0 {
            errs.push(ValidationError::new(
                "engine.max_concurrent_inferences",
                "must be at least 1",
                self.max_concurrent_inferences,
            ));
        }
        if self.min_nodes_required == 0 {
            errs.push(ValidationError::new(
                "engine.min_nodes_required",
                "must be at least 1",
                self.min_nodes_required,
            ));
        }
        if self.inference_timeout.is_zero() {
            errs.push(ValidationError::new(
                "engine.inference_timeout",
                "must be > 0",
                duration_format::format_duration(self.inference_timeout),
            ));
        }
        if self.default_layer_count == 0 {
            errs.push(ValidationError::new(
                "engine.default_layer_count",
                "must be at least 1",
                self.default_layer_count,
            ));
        }
        if self.pipeline.chunk_size == 0 {
            errs.push(ValidationError::new(
                "engine.pipeline.chunk_size",
                "must be > 0",
                self.pipeline.chunk_size,
            ));
        }
        if self.pipeline.overlap >= self.pipeline.chunk_size.max(1) {
            errs.push(ValidationError::new(
                "engine.pipeline.overlap",
                format!("must be less than chunk_size ({})", self.pipeline.chunk_size),
                self.pipeline.overlap,
            ));
        }
        if self.pipeline.layer_stages == 0 {
            errs.push(ValidationError::new(
                "engine.pipeline.layer_stages",
                "must be at least 1",
                self.pipeline.layer_stages,
            ));
        }
        errs
    }

    pub fn validate(&self) -> Result<()> {
        self.violations().into_result()
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub engine: EngineConfig,
    pub fault_tolerance: FaultToleranceConfig,
}

impl CoordinatorConfig {
    /// Load configuration from a TOML or YAML file and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoordinatorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let config = if is_yaml(path) {
            Self::from_yaml_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };

        info!(path = %path.display(), "Loaded coordinator configuration");
        Ok(config)
    }

    pub fn from_toml_str(doc: &str) -> Result<Self> {
        let config: Self = toml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(doc: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate both sections, reporting every violation.
    pub fn validate(&self) -> Result<()> {
        let mut errs = self.engine.violations();
        for err in self.fault_tolerance.violations().0 {
            errs.push(ValidationError {
                field: format!("fault_tolerance.{}", err.field),
                ..err
            });
        }
        errs.into_result()
    }

    /// Write the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)?
        } else {
            toml::to_string_pretty(self)?
        };

        // Atomic write: temp file then rename
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
