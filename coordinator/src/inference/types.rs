//! Request, partial-result and final-result types shared by the pipeline.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Free-form request parameters (temperature, max_tokens, ...)
pub type InferenceParams = BTreeMap<String, serde_json::Value>;

/// Inclusive range of model layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRange {
    pub start: u32,
    pub end: u32,
}

impl LayerRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Number of layers covered
    pub fn count(&self) -> u32 {
        self.end - self.start + 1
    }
}

/// Half-open range `[start, end)` of input tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: usize,
    pub end: usize,
}

impl TokenRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// What a planner needs to know about one inference request.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub model: String,
    pub prompt: String,
    pub parameters: InferenceParams,

    /// Layers in the model being split
    pub layer_count: u32,

    /// Size of the input, in tokens
    pub input_tokens: usize,
}

impl TaskDescriptor {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, layer_count: u32) -> Self {
        let prompt = prompt.into();
        let input_tokens = prompt.split_whitespace().count();
        Self {
            model: model.into(),
            prompt,
            parameters: InferenceParams::new(),
            layer_count,
            input_tokens,
        }
    }

    pub fn with_parameters(mut self, parameters: InferenceParams) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_input_tokens(mut self, input_tokens: usize) -> Self {
        self.input_tokens = input_tokens;
        self
    }
}

/// Output of one partition attempt on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub partition_id: String,
    pub node_id: NodeId,

    /// Position of the partition in its plan
    pub sequence: usize,

    pub text: String,
    pub payload: Vec<u8>,
    pub tokens: Vec<u32>,
    pub logits: Vec<f32>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub processing_time: Duration,

    /// Set when the attempt failed
    pub error: Option<String>,
}

impl PartialResult {
    /// An attempt that produced no output.
    pub fn failed(
        partition_id: impl Into<String>,
        node_id: NodeId,
        sequence: usize,
        error: impl Into<String>,
        processing_time: Duration,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            node_id,
            sequence,
            text: String::new(),
            payload: Vec::new(),
            tokens: Vec::new(),
            logits: Vec::new(),
            metadata: BTreeMap::new(),
            processing_time,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregated answer to an inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub text: String,
    pub tokens: Vec<u32>,
    pub logits: Vec<f32>,
    pub processing_time: Duration,
    pub nodes_used: Vec<NodeId>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl InferenceResult {
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_counts_prompt_tokens() {
        let task = TaskDescriptor::new("llama", "the quick brown fox", 32);
        assert_eq!(task.input_tokens, 4);
        let task = task.with_input_tokens(1024);
        assert_eq!(task.input_tokens, 1024);
    }

    #[test]
    fn test_ranges() {
        assert_eq!(LayerRange::new(0, 4).count(), 5);
        assert_eq!(TokenRange::new(10, 26).len(), 16);
        assert!(TokenRange::new(3, 3).is_empty());
    }

    #[test]
    fn test_failed_partial_result() {
        let result = PartialResult::failed(
            "partition_0",
            libp2p::PeerId::random(),
            0,
            "boom",
            Duration::from_millis(5),
        );
        assert!(!result.is_success());
        assert!(result.tokens.is_empty());
    }
}
