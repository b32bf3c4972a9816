//! Partition planning
//!
//! Strategies are looked up by name in a table built when the planner is
//! constructed. Every plan a strategy returns is validated against the node
//! set it was given before it leaves the planner.

use crate::config::{EngineConfig, PipelineConfig};
use crate::errors::{CoordinatorError, Result};
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::plan::{Partition, PartitionPlan, PartitionType};
use super::types::{LayerRange, TaskDescriptor, TokenRange};

/// A named way of splitting a task into partitions.
pub trait PartitionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Build a plan over `nodes`, which is never empty
    fn plan(&self, task: &TaskDescriptor, nodes: &[NodeId]) -> Result<PartitionPlan>;
}

/// Split `layer_count` layers into `parts` inclusive ranges.
///
/// Every range gets `layer_count / parts` layers; the remainder goes to the
/// last range.
pub fn split_layers(layer_count: u32, parts: u32) -> Vec<LayerRange> {
    if layer_count == 0 || parts == 0 {
        return Vec::new();
    }
    let parts = parts.min(layer_count);
    let per_part = layer_count / parts;

    (0..parts)
        .map(|i| {
            let start = i * per_part;
            let end = if i + 1 == parts {
                layer_count - 1
            } else {
                start + per_part - 1
            };
            LayerRange::new(start, end)
        })
        .collect()
}

/// Split `total` tokens into chunks of `chunk_size`, consecutive chunks
/// sharing `overlap` tokens. Empty input yields one empty chunk.
pub fn split_tokens(total: usize, chunk_size: usize, overlap: usize) -> Vec<TokenRange> {
    if total == 0 || chunk_size == 0 {
        return vec![TokenRange::new(0, 0)];
    }
    let overlap = overlap.min(chunk_size - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(total);
        chunks.push(TokenRange::new(start, end));
        if end == total {
            break;
        }
        start = end - overlap;
    }
    chunks
}

/// Even layer split, one partition per node, chained in layer order.
#[derive(Debug, Clone, Default)]
pub struct LayerwiseStrategy;

impl PartitionStrategy for LayerwiseStrategy {
    fn name(&self) -> &str {
        "layerwise"
    }

    fn plan(&self, task: &TaskDescriptor, nodes: &[NodeId]) -> Result<PartitionPlan> {
        let ranges = split_layers(task.layer_count, nodes.len() as u32);
        if ranges.is_empty() {
            return Err(CoordinatorError::InvalidPlan(format!(
                "model {} has no layers to split",
                task.model
            )));
        }

        let mut partitions: Vec<Partition> = Vec::with_capacity(ranges.len());
        for (i, range) in ranges.into_iter().enumerate() {
            let id = format!("partition_{}_layers_{}_{}", i, range.start, range.end);
            let mut partition =
                Partition::new(id, nodes[i], PartitionType::Layer).with_layers(range);
            if let Some(previous) = partitions.last() {
                partition = partition.depends_on(previous.id.clone());
            }
            partitions.push(partition);
        }

        Ok(PartitionPlan::new(self.name(), partitions))
    }
}

/// Input chunks spread round-robin over the nodes.
///
/// With `layer_stages > 1` each chunk is also split by layer, and stage `s`
/// of a chunk depends on stage `s - 1` of the same chunk. Chunks never
/// depend on each other.
#[derive(Debug, Clone)]
pub struct PipelineParallelStrategy {
    pub chunk_size: usize,
    pub overlap: usize,
    pub layer_stages: u32,
}

impl PipelineParallelStrategy {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            overlap: config.overlap,
            layer_stages: config.layer_stages,
        }
    }
}

impl Default for PipelineParallelStrategy {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl PartitionStrategy for PipelineParallelStrategy {
    fn name(&self) -> &str {
        "pipeline_parallel"
    }

    fn plan(&self, task: &TaskDescriptor, nodes: &[NodeId]) -> Result<PartitionPlan> {
        let chunks = split_tokens(task.input_tokens, self.chunk_size, self.overlap);
        let stages = if self.layer_stages > 1 {
            split_layers(task.layer_count, self.layer_stages)
        } else {
            Vec::new()
        };
        let stage_count = stages.len().max(1);

        let mut partitions = Vec::with_capacity(chunks.len() * stage_count);
        for (c, chunk) in chunks.iter().enumerate() {
            for s in 0..stage_count {
                let i = partitions.len();
                let id = format!("partition_{}_chunk_{}_stage_{}", i, c, s);
                let node = nodes[i % nodes.len()];

                let mut partition =
                    Partition::new(id, node, PartitionType::Sequence).with_tokens(*chunk);
                if let Some(range) = stages.get(s) {
                    partition = partition.with_layers(*range);
                }
                if s > 0 {
                    let previous: &Partition = &partitions[i - 1];
                    partition = partition.depends_on(previous.id.clone());
                }
                partitions.push(partition);
            }
        }

        Ok(PartitionPlan::new(self.name(), partitions))
    }
}

/// Usage counters for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub total_plans: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Mean end-to-end latency of executions using this strategy
    pub average_latency: Duration,
    pub last_used: Option<DateTime<Utc>>,
}

impl StrategyMetrics {
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_executions + self.failed_executions;
        if total == 0 {
            return 0.0;
        }
        self.successful_executions as f64 / total as f64
    }
}

/// Chooses a strategy by name and produces validated plans.
pub struct PartitionPlanner {
    strategies: HashMap<String, Arc<dyn PartitionStrategy>>,
    min_nodes_required: usize,
    metrics: RwLock<HashMap<String, StrategyMetrics>>,
}

impl PartitionPlanner {
    /// Planner with the built-in strategies
    pub fn new(config: &EngineConfig) -> Self {
        let mut planner = Self {
            strategies: HashMap::new(),
            min_nodes_required: config.min_nodes_required,
            metrics: RwLock::new(HashMap::new()),
        };
        planner.register_strategy(Arc::new(LayerwiseStrategy));
        planner.register_strategy(Arc::new(PipelineParallelStrategy::new(&config.pipeline)));
        planner
    }

    /// Add or replace a strategy under its own name
    pub fn register_strategy(&mut self, strategy: Arc<dyn PartitionStrategy>) {
        debug!(strategy = %strategy.name(), "Registered partition strategy");
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn min_nodes_required(&self) -> usize {
        self.min_nodes_required
    }

    /// Produce a plan for `task` over `nodes` using `strategy`
    pub fn plan(
        &self,
        task: &TaskDescriptor,
        nodes: &[NodeId],
        strategy: &str,
    ) -> Result<PartitionPlan> {
        let required = self.min_nodes_required.max(1);
        if nodes.len() < required {
            return Err(CoordinatorError::InsufficientNodes {
                required,
                available: nodes.len(),
            });
        }

        let strategy_impl = self
            .strategies
            .get(strategy)
            .ok_or_else(|| CoordinatorError::InvalidStrategy(strategy.to_string()))?;

        let plan = strategy_impl.plan(task, nodes)?;
        plan.validate(nodes)?;

        info!(
            model = %task.model,
            strategy = %strategy,
            partitions = plan.len(),
            edges = plan.edge_count(),
            "Created partition plan"
        );
        Ok(plan)
    }

    /// Fold one execution outcome into the strategy's counters
    pub async fn record_outcome(&self, strategy: &str, success: bool, latency: Duration) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(strategy.to_string()).or_default();

        entry.total_plans += 1;
        if success {
            entry.successful_executions += 1;
        } else {
            entry.failed_executions += 1;
        }

        let n = entry.total_plans as u32;
        entry.average_latency = (entry.average_latency * (n - 1) + latency) / n;
        entry.last_used = Some(Utc::now());
    }

    pub async fn strategy_metrics(&self) -> HashMap<String, StrategyMetrics> {
        self.metrics.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n).map(|_| PeerId::random()).collect()
    }

    fn planner(min_nodes: usize) -> PartitionPlanner {
        PartitionPlanner::new(&EngineConfig::default().with_min_nodes(min_nodes))
    }

    #[test]
    fn test_split_layers_even_and_remainder() {
        assert_eq!(
            split_layers(10, 2),
            vec![LayerRange::new(0, 4), LayerRange::new(5, 9)]
        );
        assert_eq!(
            split_layers(10, 3),
            vec![
                LayerRange::new(0, 2),
                LayerRange::new(3, 5),
                LayerRange::new(6, 9)
            ]
        );
        // more parts than layers collapses to one layer each
        assert_eq!(split_layers(2, 4).len(), 2);
        assert!(split_layers(0, 3).is_empty());
    }

    #[test]
    fn test_split_tokens_with_overlap() {
        assert_eq!(
            split_tokens(20, 8, 2),
            vec![
                TokenRange::new(0, 8),
                TokenRange::new(6, 14),
                TokenRange::new(12, 20)
            ]
        );
        assert_eq!(split_tokens(5, 8, 2), vec![TokenRange::new(0, 5)]);
        assert_eq!(split_tokens(0, 8, 2), vec![TokenRange::new(0, 0)]);
    }

    #[test]
    fn test_layerwise_plan_is_a_chain() {
        let nodes = nodes(2);
        let task = TaskDescriptor::new("llama-X", "hi", 10);
        let plan = planner(2).plan(&task, &nodes, "layerwise").unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.edge_count(), 1);
        assert_eq!(plan.partitions[0].id, "partition_0_layers_0_4");
        assert_eq!(plan.partitions[1].id, "partition_1_layers_5_9");
        assert_eq!(plan.partitions[1].dependencies, vec!["partition_0_layers_0_4"]);
        assert_eq!(plan.partitions[0].node_id, nodes[0]);
        assert_eq!(plan.partitions[1].node_id, nodes[1]);
    }

    #[test]
    fn test_pipeline_chunks_are_independent() {
        let nodes = nodes(2);
        let planner = PartitionPlanner::new(&EngineConfig::default().with_pipeline(PipelineConfig {
            chunk_size: 4,
            overlap: 1,
            layer_stages: 1,
        }));
        let task = TaskDescriptor::new("m", "", 32).with_input_tokens(10);
        let plan = planner.plan(&task, &nodes, "pipeline_parallel").unwrap();

        // [0,4) [3,7) [6,10)
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.edge_count(), 0);
        assert_eq!(plan.partitions[2].node_id, nodes[0]);
        assert_eq!(plan.partitions[1].id, "partition_1_chunk_1_stage_0");
    }

    #[test]
    fn test_pipeline_with_layer_stages_chains_within_chunk() {
        let nodes = nodes(3);
        let planner = PartitionPlanner::new(&EngineConfig::default().with_pipeline(PipelineConfig {
            chunk_size: 4,
            overlap: 0,
            layer_stages: 2,
        }));
        let task = TaskDescriptor::new("m", "", 8).with_input_tokens(8);
        let plan = planner.plan(&task, &nodes, "pipeline_parallel").unwrap();

        assert_eq!(plan.len(), 4);
        assert_eq!(plan.edge_count(), 2);
        assert_eq!(
            plan.partitions[1].dependencies,
            vec!["partition_0_chunk_0_stage_0"]
        );
        assert!(plan.partitions[2].dependencies.is_empty());
        assert_eq!(plan.partitions[3].layer_range, Some(LayerRange::new(4, 7)));
    }

    #[test]
    fn test_insufficient_nodes() {
        let task = TaskDescriptor::new("m", "hi", 10);
        let err = planner(3).plan(&task, &nodes(2), "layerwise").unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::InsufficientNodes {
                required: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn test_unknown_strategy() {
        let task = TaskDescriptor::new("m", "hi", 10);
        let err = planner(1).plan(&task, &nodes(2), "zigzag").unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidStrategy(name) if name == "zigzag"));
    }

    #[test]
    fn test_every_plan_is_valid_over_its_nodes() {
        let planner = planner(1);
        for n in 1..6 {
            let nodes = nodes(n);
            for layers in [1u32, 7, 32, 80] {
                let task = TaskDescriptor::new("m", "a b c", layers).with_input_tokens(1500);
                for strategy in planner.strategy_names() {
                    let plan = planner.plan(&task, &nodes, &strategy).unwrap();
                    plan.validate(&nodes).unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_strategy_metrics() {
        let planner = planner(1);
        planner
            .record_outcome("layerwise", true, Duration::from_millis(100))
            .await;
        planner
            .record_outcome("layerwise", false, Duration::from_millis(300))
            .await;

        let metrics = planner.strategy_metrics().await;
        let layerwise = &metrics["layerwise"];
        assert_eq!(layerwise.total_plans, 2);
        assert_eq!(layerwise.success_rate(), 0.5);
        assert_eq!(layerwise.average_latency, Duration::from_millis(200));
        assert!(layerwise.last_used.is_some());
    }
}
