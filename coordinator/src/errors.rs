use std::fmt;
use thiserror::Error;

/// Pipeline stage an inference failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DistributeModel,
    SelectNodes,
    CreatePlan,
    ExecutePartitions,
    Aggregate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DistributeModel => "distribute model",
            Stage::SelectNodes => "select nodes",
            Stage::CreatePlan => "create partition plan",
            Stage::ExecutePartitions => "execute partitions",
            Stage::Aggregate => "aggregate results",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single violated configuration rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Dotted path of the offending field (e.g. `self_healing.healing_interval`)
    pub field: String,
    /// Human-readable constraint that was violated
    pub constraint: String,
    /// Offending value as written
    pub value: String,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        constraint: impl Into<String>,
        value: impl fmt::Display,
    ) -> Self {
        Self {
            field: field.into(),
            constraint: constraint.into(),
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (got {})", self.field, self.constraint, self.value)
    }
}

/// Every rule a rejected configuration document violated.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, err: ValidationError) {
        self.0.push(err);
    }

    /// True if any violation names `field`.
    pub fn has_field(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    pub fn fields(&self) -> Vec<&str> {
        self.0.iter().map(|e| e.field.as_str()).collect()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CoordinatorError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        f.write_str(&parts.join("; "))
    }
}

/// Errors that can occur while coordinating distributed inference.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// IO error occurred (file operations, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (unreadable file, unknown format, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration document violated one or more rules
    #[error("configuration validation failed: {0}")]
    Validation(ValidationErrors),

    /// Peer transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Lookup miss in a registry
    #[error("not found: {0}")]
    NotFound(String),

    /// Planner was handed fewer nodes than it needs
    #[error("insufficient nodes: need {required}, have {available}")]
    InsufficientNodes { required: usize, available: usize },

    /// Too few nodes survived selection filters
    #[error("insufficient available nodes: need {required}, have {available}")]
    InsufficientAvailableNodes { required: usize, available: usize },

    #[error("unknown strategy: {0}")]
    InvalidStrategy(String),

    /// A plan failed structural checks
    #[error("invalid partition plan: {0}")]
    InvalidPlan(String),

    /// First partition failure of an execution
    #[error("failed to execute partition {partition_id} on node {node_id}: {source}")]
    PartitionExecution {
        partition_id: String,
        node_id: String,
        #[source]
        source: Box<CoordinatorError>,
    },

    /// Partition never dispatched because something it depends on failed
    #[error("partition {partition_id} skipped: dependency {dependency} failed")]
    DependencyFailed {
        partition_id: String,
        dependency: String,
    },

    /// A spawned task panicked or was aborted
    #[error("task failed: {0}")]
    Task(String),

    #[error("no partial results to aggregate")]
    NoPartialResults,

    #[error("model distribution failed: {0}")]
    ModelDistribution(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation canceled")]
    Canceled,

    /// Circuit breaker rejected the call
    #[error("circuit open for {key}")]
    CircuitOpen { key: String },

    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("healing failed: {0}")]
    Healing(String),

    /// Error annotated with the pipeline stage it came from
    #[error("failed to {stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<CoordinatorError>,
    },
}

impl CoordinatorError {
    /// Wrap this error with the stage it occurred in.
    pub fn at(self, stage: Stage) -> Self {
        CoordinatorError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Strip stage annotations down to the originating error.
    pub fn root_cause(&self) -> &CoordinatorError {
        match self {
            CoordinatorError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Stage this error was raised in, if annotated.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            CoordinatorError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether a node-facing call that failed this way may be retried.
    pub fn is_retryable(&self) -> bool {
        match self.root_cause() {
            CoordinatorError::Transport(_)
            | CoordinatorError::Timeout(_)
            | CoordinatorError::Io(_) => true,
            CoordinatorError::PartitionExecution { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl From<toml::de::Error> for CoordinatorError {
    fn from(e: toml::de::Error) -> Self {
        CoordinatorError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for CoordinatorError {
    fn from(e: toml::ser::Error) -> Self {
        CoordinatorError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for CoordinatorError {
    fn from(e: serde_yaml::Error) -> Self {
        CoordinatorError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(e: serde_json::Error) -> Self {
        CoordinatorError::Serialization(e.to_string())
    }
}
