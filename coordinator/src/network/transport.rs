//! Peer transport contract and an in-process mock
//!
//! The coordinator never opens connections itself. It hands partition
//! requests to a [`PeerTransport`] and awaits the response; timeouts and
//! cancellation are applied by the caller dropping the returned future, so
//! implementations must be cancel-safe.

use crate::errors::{CoordinatorError, Result};
use crate::inference::types::{InferenceParams, LayerRange, TokenRange};
use crate::node::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Work for one partition, addressed to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRequest {
    /// `<session_id>_<partition_id>`
    pub request_id: String,
    pub model: String,
    pub prompt: String,
    pub parameters: InferenceParams,
    pub partition_id: String,
    pub layer_range: Option<LayerRange>,
    pub token_range: Option<TokenRange>,
    pub metadata: BTreeMap<String, String>,
}

/// A node's answer to a [`PartitionRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionResponse {
    pub text: String,
    pub payload: Vec<u8>,
    pub tokens: Vec<u32>,
    pub logits: Vec<f32>,
    pub processing_time: Duration,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Sends partition requests to peers
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_partition_request(
        &self,
        node: &NodeId,
        request: PartitionRequest,
    ) -> Result<PartitionResponse>;
}

/// How the mock answers requests for a node.
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Answer after `latency`
    Respond { latency: Duration },
    /// Fail every request
    Fail { message: String },
    /// Fail the first `failures` requests, then answer
    FailFirst { failures: usize, latency: Duration },
    /// Never answer
    Hang,
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior::Respond {
            latency: Duration::ZERO,
        }
    }
}

/// Scriptable transport for tests and local simulation
///
/// Responses are derived from the request so results are deterministic:
/// the text names the partition, tokens enumerate its layer or token range.
#[derive(Debug, Default)]
pub struct MockPeerTransport {
    default_behavior: MockBehavior,
    behaviors: RwLock<HashMap<NodeId, MockBehavior>>,
    calls: RwLock<Vec<(NodeId, PartitionRequest)>>,
    call_counts: RwLock<HashMap<NodeId, usize>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockPeerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_behavior(mut self, behavior: MockBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    pub async fn set_behavior(&self, node: NodeId, behavior: MockBehavior) {
        self.behaviors.write().await.insert(node, behavior);
    }

    /// Every request received, in arrival order
    pub async fn calls(&self) -> Vec<(NodeId, PartitionRequest)> {
        self.calls.read().await.clone()
    }

    pub async fn call_count(&self, node: &NodeId) -> usize {
        self.call_counts.read().await.get(node).copied().unwrap_or(0)
    }

    pub async fn total_calls(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Requests currently awaiting an answer
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrency observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(request: &PartitionRequest, latency: Duration) -> PartitionResponse {
        let tokens: Vec<u32> = match (request.layer_range, request.token_range) {
            (_, Some(range)) => (range.start as u32..range.end as u32).collect(),
            (Some(range), None) => (range.start..=range.end).collect(),
            (None, None) => Vec::new(),
        };
        let logits = tokens.iter().map(|t| *t as f32 * 0.5).collect();

        PartitionResponse {
            text: format!("[{}]", request.partition_id),
            payload: request.partition_id.as_bytes().to_vec(),
            tokens,
            logits,
            processing_time: latency,
            metadata: BTreeMap::new(),
        }
    }
}

/// Decrements the in-flight counter even when the request future is dropped
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn send_partition_request(
        &self,
        node: &NodeId,
        request: PartitionRequest,
    ) -> Result<PartitionResponse> {
        let attempt = {
            let mut counts = self.call_counts.write().await;
            let count = counts.entry(*node).or_insert(0);
            *count += 1;
            *count
        };
        self.calls.write().await.push((*node, request.clone()));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        let behavior = self
            .behaviors
            .read()
            .await
            .get(node)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());

        debug!(node_id = %node, partition_id = %request.partition_id, ?behavior, "Mock request");

        match behavior {
            MockBehavior::Respond { latency } => {
                tokio::time::sleep(latency).await;
                Ok(Self::respond(&request, latency))
            }
            MockBehavior::Fail { message } => Err(CoordinatorError::Transport(message)),
            MockBehavior::FailFirst { failures, latency } => {
                if attempt <= failures {
                    Err(CoordinatorError::Transport(format!(
                        "simulated failure {} of {}",
                        attempt, failures
                    )))
                } else {
                    tokio::time::sleep(latency).await;
                    Ok(Self::respond(&request, latency))
                }
            }
            MockBehavior::Hang => {
                futures::future::pending::<()>().await;
                Err(CoordinatorError::Canceled)
            }
        }
    }
}
