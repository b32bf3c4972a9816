//! Fault-tolerant wrapper around a [`PeerTransport`]
//!
//! Every node-facing call goes through breaker admission, then the retry
//! policy; each attempt is sampled into the performance tracker and its
//! outcome reported back to the breaker. The inference session never sees
//! retries, only the final outcome.
//!
//! An admitted call that is dropped before the node answers (session
//! deadline, cancel) still settles as a failure, so a half-open circuit
//! never waits on a call that will not return.

use crate::errors::Result;
use crate::network::{PartitionRequest, PartitionResponse, PeerTransport};
use crate::node::NodeId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::circuit_breaker::{node_key, CircuitBreakerRegistry};
use super::performance::PerformanceTracker;
use super::retry::RetryPolicy;

/// Settles an admitted call if it is dropped before completing
struct PendingCall {
    key: String,
    breakers: Arc<CircuitBreakerRegistry>,
    performance: Option<Arc<PerformanceTracker>>,
    started: Instant,
    settled: bool,
}

impl PendingCall {
    fn settle(mut self) -> Duration {
        self.settled = true;
        self.started.elapsed()
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let key = std::mem::take(&mut self.key);
        let breakers = self.breakers.clone();
        let performance = self.performance.take();
        let elapsed = self.started.elapsed();
        debug!(key = %key, elapsed_ms = elapsed.as_millis() as u64, "Node call abandoned");

        runtime.spawn(async move {
            breakers.record_failure(&key).await;
            if let Some(tracker) = performance {
                tracker.record(&key, elapsed, false).await;
            }
        });
    }
}

pub struct ResilientTransport {
    inner: Arc<dyn PeerTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RwLock<RetryPolicy>,
    performance: Option<Arc<PerformanceTracker>>,
}

impl ResilientTransport {
    pub fn new(inner: Arc<dyn PeerTransport>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            inner,
            breakers,
            retry: RwLock::new(RetryPolicy::default()),
            performance: None,
        }
    }

    pub fn with_retry(self, policy: RetryPolicy) -> Self {
        Self {
            retry: RwLock::new(policy),
            ..self
        }
    }

    pub fn with_performance_tracker(mut self, tracker: Arc<PerformanceTracker>) -> Self {
        self.performance = Some(tracker);
        self
    }

    /// Swap the retry policy for calls started after this returns
    pub async fn set_retry(&self, policy: RetryPolicy) {
        *self.retry.write().await = policy;
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    async fn attempt(
        &self,
        key: &str,
        node: &NodeId,
        request: PartitionRequest,
    ) -> Result<PartitionResponse> {
        self.breakers.try_acquire(key).await?;

        let pending = PendingCall {
            key: key.to_string(),
            breakers: self.breakers.clone(),
            performance: self.performance.clone(),
            started: Instant::now(),
            settled: false,
        };
        let outcome = self.inner.send_partition_request(node, request).await;
        let elapsed = pending.settle();

        match &outcome {
            Ok(_) => self.breakers.record_success(key).await,
            Err(e) => {
                debug!(node_id = %node, error = %e, "Node call failed");
                self.breakers.record_failure(key).await;
            }
        }
        if let Some(tracker) = &self.performance {
            tracker.record(key, elapsed, outcome.is_ok()).await;
        }
        outcome
    }
}

#[async_trait]
impl PeerTransport for ResilientTransport {
    async fn send_partition_request(
        &self,
        node: &NodeId,
        request: PartitionRequest,
    ) -> Result<PartitionResponse> {
        let key = node_key(node);
        let policy = self.retry.read().await.clone();
        policy
            .run(&key, |_| self.attempt(&key, node, request.clone()))
            .await
    }
}
