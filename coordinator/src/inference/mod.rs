//! Distributed inference coordination
//!
//! A request is split into partitions, each partition is sent to one node,
//! and the partial results are merged back into one answer.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ execute_distributed_inference(model, prompt, params)
//!   ▼
//! ┌─────────────────────────────────────────┐
//! │           DistributedEngine             │
//! │  • one InferenceSession per request     │
//! │  • active-session registry, cancel      │
//! │  • inference_timeout bounds everything  │
//! └─────────────────────────────────────────┘
//!   │ Pending: ensure model distribution (ModelManager)
//!   │ Partitioning:
//!   ├──▶ NodeSelector ──▶ NodeRegistry + circuit breakers
//!   ├──▶ PartitionPlanner ──▶ strategy table (layerwise, pipeline_parallel)
//!   │ Executing:
//!   ├──▶ Orchestrator ──▶ TaskGroup ──▶ PeerTransport (one task per partition)
//!   │ Aggregating:
//!   └──▶ ResultAggregator ──▶ strategy table (concat, concat_text)
//! ```
//!
//! ## Key Components
//!
//! - [`DistributedEngine`]: entry point and session lifecycle
//! - [`PartitionPlanner`]: turns a task and node set into a partition DAG
//! - [`NodeSelector`]: deterministic, load-ranked node choice
//! - [`Orchestrator`]: dependency-ordered fan-out with a wait-all barrier
//! - [`ResultAggregator`]: plan-ordered merge of partial results
//! - [`InferenceStats`]: rolling counters and averages

pub mod aggregator;
pub mod engine;
pub mod orchestration;
pub mod plan;
pub mod planner;
pub mod selector;
pub mod session;
pub mod stats;
pub mod task_group;
pub mod types;

pub use aggregator::{AggregationStrategy, ConcatTextStrategy, NaiveConcatStrategy, ResultAggregator};
pub use engine::DistributedEngine;
pub use orchestration::{ExecutionContext, ExecutionReport, Orchestrator, PartitionFailure, RequestTemplate};
pub use plan::{Partition, PartitionPlan, PartitionStatus, PartitionType};
pub use planner::{
    LayerwiseStrategy, PartitionPlanner, PartitionStrategy, PipelineParallelStrategy,
    StrategyMetrics,
};
pub use selector::NodeSelector;
pub use session::{InferenceSession, SessionHandle, SessionSnapshot, SessionStatus};
pub use stats::{InferenceMetrics, InferenceStats};
pub use task_group::TaskGroup;
pub use types::{
    InferenceParams, InferenceResult, LayerRange, PartialResult, TaskDescriptor, TokenRange,
};
