pub mod config;
pub mod errors;
pub mod fault_tolerance;
pub mod inference;
pub mod model;
pub mod network;
pub mod node;
pub mod observability;

pub use config::{CoordinatorConfig, EngineConfig, PipelineConfig};
pub use errors::{CoordinatorError, Result, Stage, ValidationError, ValidationErrors};
pub use fault_tolerance::{
    CircuitBreakerRegistry, FaultDetection, FaultToleranceConfig, FaultToleranceManager,
    FaultToleranceMetrics, FaultType, PerformanceTracker, ResilientTransport, RetryPolicy,
};
pub use inference::{
    DistributedEngine, InferenceMetrics, InferenceParams, InferenceResult, PartitionPlan,
    PartitionPlanner, SessionSnapshot, SessionStatus, TaskDescriptor,
};
pub use model::{ModelInfo, ModelManager, ModelRegistry};
pub use network::{MockBehavior, MockPeerTransport, PartitionRequest, PartitionResponse, PeerTransport};
pub use node::{NodeId, NodeInfo, NodeRegistry, NodeStatus};
pub use observability::{init_production_logging, init_simple_logging};
