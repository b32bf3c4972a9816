//! Merging partial results
//!
//! Results are always sorted by their position in the plan before a strategy
//! sees them, so completion order never changes the aggregate. Failed
//! partial results are dropped first.

use crate::errors::{CoordinatorError, Result};
use crate::node::NodeId;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{InferenceResult, PartialResult};

/// A named way of merging successful partial results.
pub trait AggregationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// `results` is non-empty, successful and in plan order
    fn aggregate(&self, results: &[PartialResult]) -> Result<InferenceResult>;
}

fn distinct_nodes(results: &[PartialResult]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    results
        .iter()
        .filter(|r| seen.insert(r.node_id))
        .map(|r| r.node_id)
        .collect()
}

/// Tokens, logits and timing shared by both concatenation strategies
fn concat_base(strategy: &str, results: &[PartialResult]) -> InferenceResult {
    let nodes_used = distinct_nodes(results);
    let tokens = results.iter().flat_map(|r| r.tokens.iter().copied()).collect();
    let logits = results.iter().flat_map(|r| r.logits.iter().copied()).collect();
    let processing_time = results
        .iter()
        .map(|r| r.processing_time)
        .max()
        .unwrap_or(Duration::ZERO);

    let mut metadata = BTreeMap::new();
    metadata.insert("nodes_used".to_string(), json!(nodes_used.len()));
    metadata.insert("partitions_executed".to_string(), json!(results.len()));
    metadata.insert("aggregation_strategy".to_string(), json!(strategy));

    InferenceResult {
        text: String::new(),
        tokens,
        logits,
        processing_time,
        nodes_used,
        metadata,
    }
}

/// Concatenates tokens and logits; text is the first successful text only.
///
/// Multi-node text is collapsed rather than merged, and the result is
/// tagged `text_merge = "naive"` so callers can tell.
#[derive(Debug, Clone, Default)]
pub struct NaiveConcatStrategy;

impl AggregationStrategy for NaiveConcatStrategy {
    fn name(&self) -> &str {
        "concat"
    }

    fn aggregate(&self, results: &[PartialResult]) -> Result<InferenceResult> {
        let mut result = concat_base(self.name(), results);
        let texts: Vec<&str> = results
            .iter()
            .map(|r| r.text.as_str())
            .filter(|t| !t.is_empty())
            .collect();
        let first_text = texts.first().copied().unwrap_or_default();

        // Counts text-bearing partitions, not distinct nodes
        result.text = if texts.len() > 1 {
            format!("Combined result from {} nodes: {}", texts.len(), first_text)
        } else {
            first_text.to_string()
        };
        result
            .metadata
            .insert("text_merge".to_string(), json!("naive"));
        Ok(result)
    }
}

/// Concatenates tokens, logits and every partition's text in plan order.
#[derive(Debug, Clone, Default)]
pub struct ConcatTextStrategy;

impl AggregationStrategy for ConcatTextStrategy {
    fn name(&self) -> &str {
        "concat_text"
    }

    fn aggregate(&self, results: &[PartialResult]) -> Result<InferenceResult> {
        let mut result = concat_base(self.name(), results);
        result.text = results.iter().map(|r| r.text.as_str()).collect();
        result
            .metadata
            .insert("text_merge".to_string(), json!("concat"));
        Ok(result)
    }
}

pub struct ResultAggregator {
    strategies: HashMap<String, Arc<dyn AggregationStrategy>>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        let mut aggregator = Self {
            strategies: HashMap::new(),
        };
        aggregator.register_strategy(Arc::new(NaiveConcatStrategy));
        aggregator.register_strategy(Arc::new(ConcatTextStrategy));
        aggregator
    }

    pub fn register_strategy(&mut self, strategy: Arc<dyn AggregationStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn has_strategy(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    pub fn aggregate(&self, strategy: &str, results: Vec<PartialResult>) -> Result<InferenceResult> {
        let strategy_impl = self
            .strategies
            .get(strategy)
            .ok_or_else(|| CoordinatorError::InvalidStrategy(strategy.to_string()))?;

        let total = results.len();
        let mut usable: Vec<PartialResult> = results.into_iter().filter(|r| r.is_success()).collect();
        if usable.len() < total {
            warn!(
                excluded = total - usable.len(),
                "Excluding failed partial results from aggregation"
            );
        }
        if usable.is_empty() {
            return Err(CoordinatorError::NoPartialResults);
        }
        usable.sort_by_key(|r| r.sequence);

        debug!(strategy = %strategy, partials = usable.len(), "Aggregating results");
        strategy_impl.aggregate(&usable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    fn partial(sequence: usize, node: NodeId, text: &str, tokens: Vec<u32>) -> PartialResult {
        PartialResult {
            partition_id: format!("partition_{}", sequence),
            node_id: node,
            sequence,
            text: text.to_string(),
            payload: Vec::new(),
            logits: tokens.iter().map(|t| *t as f32).collect(),
            tokens,
            metadata: BTreeMap::new(),
            processing_time: Duration::from_millis(10 * (sequence as u64 + 1)),
            error: None,
        }
    }

    #[test]
    fn test_naive_concat_collapses_text() {
        let (a, b) = (PeerId::random(), PeerId::random());
        let result = ResultAggregator::new()
            .aggregate(
                "concat",
                vec![partial(0, a, "first", vec![1, 2]), partial(1, b, "second", vec![3])],
            )
            .unwrap();

        assert_eq!(result.text, "Combined result from 2 nodes: first");
        assert_eq!(result.tokens, vec![1, 2, 3]);
        assert_eq!(result.metadata["text_merge"], "naive");
        assert_eq!(result.metadata["nodes_used"], 2);
        assert_eq!(result.metadata["partitions_executed"], 2);
    }

    #[test]
    fn test_naive_concat_counts_text_parts() {
        let (a, b) = (PeerId::random(), PeerId::random());
        let aggregator = ResultAggregator::new();

        let round_robin = aggregator
            .aggregate(
                "concat",
                vec![
                    partial(0, a, "one", vec![1]),
                    partial(1, b, "two", vec![2]),
                    partial(2, a, "three", vec![3]),
                ],
            )
            .unwrap();
        assert_eq!(round_robin.text, "Combined result from 3 nodes: one");
        assert_eq!(round_robin.metadata["nodes_used"], 2);

        let single_node = aggregator
            .aggregate(
                "concat",
                vec![partial(0, a, "one", vec![1]), partial(1, a, "", vec![2]), partial(2, a, "three", vec![3])],
            )
            .unwrap();
        assert_eq!(single_node.text, "Combined result from 2 nodes: one");
    }

    #[test]
    fn test_concat_text_joins_in_plan_order() {
        let a = PeerId::random();
        let result = ResultAggregator::new()
            .aggregate(
                "concat_text",
                vec![partial(1, a, "world", vec![2]), partial(0, a, "hello ", vec![1])],
            )
            .unwrap();
        assert_eq!(result.text, "hello world");
        assert_eq!(result.tokens, vec![1, 2]);
        assert_eq!(result.nodes_used, vec![a]);
    }

    #[test]
    fn test_arrival_order_does_not_change_result() {
        let nodes: Vec<NodeId> = (0..4).map(|_| PeerId::random()).collect();
        let partials: Vec<PartialResult> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| partial(i, *n, &format!("t{}", i), vec![i as u32 * 10, i as u32 * 10 + 1]))
            .collect();

        let aggregator = ResultAggregator::new();
        let forward = aggregator.aggregate("concat_text", partials.clone()).unwrap();
        let mut reversed = partials.clone();
        reversed.reverse();
        let backward = aggregator.aggregate("concat_text", reversed).unwrap();
        let mut rotated = partials;
        rotated.rotate_left(2);
        let rotated = aggregator.aggregate("concat_text", rotated).unwrap();

        assert_eq!(forward, backward);
        assert_eq!(forward, rotated);
    }

    #[test]
    fn test_failed_results_are_excluded() {
        let a = PeerId::random();
        let failed = PartialResult::failed("partition_1", a, 1, "boom", Duration::ZERO);
        let result = ResultAggregator::new()
            .aggregate("concat", vec![partial(0, a, "ok", vec![7]), failed])
            .unwrap();
        assert_eq!(result.tokens, vec![7]);
        assert_eq!(result.text, "ok");
    }

    #[test]
    fn test_all_failed() {
        let a = PeerId::random();
        let err = ResultAggregator::new()
            .aggregate(
                "concat",
                vec![PartialResult::failed("p", a, 0, "boom", Duration::ZERO)],
            )
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NoPartialResults));
    }

    #[test]
    fn test_unknown_strategy() {
        let err = ResultAggregator::new().aggregate("mean", Vec::new()).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidStrategy(_)));
    }
}
