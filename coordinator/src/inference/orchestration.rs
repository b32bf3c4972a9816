//! Partition plan execution
//!
//! Partitions are dispatched as soon as every dependency has completed.
//! Independent partitions run concurrently, one task each, inside a
//! [`TaskGroup`]. A failed partition does not cancel its siblings; its
//! dependents are marked failed without being dispatched. `execute` returns
//! only after every dispatched task has settled.

use crate::errors::{CoordinatorError, Result};
use crate::network::{PartitionRequest, PeerTransport};
use crate::node::NodeId;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::plan::{PartitionPlan, PartitionStatus};
use super::task_group::TaskGroup;
use super::types::{InferenceParams, PartialResult};

/// Request fields shared by every partition of one inference
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub model: String,
    pub prompt: String,
    pub parameters: InferenceParams,
}

/// Deadline and cancellation for one execution
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub inference_id: String,
    pub deadline: Instant,
    /// Budget the deadline was derived from, reported on timeout
    pub timeout: Duration,
    pub cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    pub fn new(inference_id: impl Into<String>, timeout: Duration, cancel: watch::Receiver<bool>) -> Self {
        Self {
            inference_id: inference_id.into(),
            deadline: Instant::now() + timeout,
            timeout,
            cancel,
        }
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// A partition that did not produce a result
#[derive(Debug)]
pub struct PartitionFailure {
    pub partition_id: String,
    pub node_id: NodeId,
    pub sequence: usize,
    pub error: CoordinatorError,
}

/// Outcome of executing a plan
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Successful results in plan order
    pub results: Vec<PartialResult>,
    /// Failures in the order they were observed
    pub failures: Vec<PartitionFailure>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn first_failure(&self) -> Option<&PartitionFailure> {
        self.failures.first()
    }

    /// Results, or the first failure as a `PartitionExecution` error
    pub fn into_result(self) -> Result<Vec<PartialResult>> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(CoordinatorError::PartitionExecution {
                partition_id: failure.partition_id,
                node_id: failure.node_id.to_string(),
                source: Box::new(failure.error),
            }),
            None => Ok(self.results),
        }
    }
}

pub struct Orchestrator {
    transport: Arc<dyn PeerTransport>,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    /// Execute `plan`, updating partition status, timestamps and results in place
    #[instrument(skip_all, fields(inference_id = %ctx.inference_id, partitions = plan.len()))]
    pub async fn execute(
        &self,
        plan: &mut PartitionPlan,
        template: &RequestTemplate,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionReport> {
        plan.topological_order()?;

        let n = plan.len();
        let mut waiting_on: Vec<usize> = plan
            .partitions
            .iter()
            .map(|p| p.dependencies.len())
            .collect();
        let dependents: Vec<Vec<usize>> = (0..n).map(|i| plan.dependents_of(i)).collect();

        let mut report = ExecutionReport::default();
        let mut results: BTreeMap<usize, PartialResult> = BTreeMap::new();
        let mut group: TaskGroup<(usize, Result<PartialResult>)> = TaskGroup::new();

        let ready: Vec<usize> = (0..n).filter(|&i| waiting_on[i] == 0).collect();
        for i in ready {
            self.dispatch(plan, i, template, ctx, &mut group)?;
        }

        while let Some(joined) = group.next().await {
            let (index, outcome) = match joined {
                Ok(settled) => settled,
                Err(e) => {
                    // The partition is identified below when it is found still executing
                    error!(error = %e, "Partition task aborted");
                    continue;
                }
            };

            match outcome {
                Ok(result) => {
                    let partition = &mut plan.partitions[index];
                    partition.transition(PartitionStatus::Completed)?;
                    partition.result = Some(result.clone());
                    debug!(
                        partition_id = %partition.id,
                        node_id = %partition.node_id,
                        elapsed_ms = result.processing_time.as_millis() as u64,
                        "Partition completed"
                    );
                    results.insert(index, result);

                    for &next in &dependents[index] {
                        waiting_on[next] -= 1;
                        if waiting_on[next] == 0
                            && plan.partitions[next].status == PartitionStatus::Pending
                        {
                            self.dispatch(plan, next, template, ctx, &mut group)?;
                        }
                    }
                }
                Err(e) => {
                    let partition = &mut plan.partitions[index];
                    warn!(
                        partition_id = %partition.id,
                        node_id = %partition.node_id,
                        error = %e,
                        "Partition failed"
                    );
                    partition.transition(PartitionStatus::Failed)?;
                    let failed = PartialResult::failed(
                        partition.id.clone(),
                        partition.node_id,
                        index,
                        e.to_string(),
                        partition
                            .started_at
                            .map(|at| (chrono::Utc::now() - at).to_std().unwrap_or_default())
                            .unwrap_or_default(),
                    );
                    partition.result = Some(failed);
                    report.failures.push(PartitionFailure {
                        partition_id: partition.id.clone(),
                        node_id: partition.node_id,
                        sequence: index,
                        error: e,
                    });
                    skip_dependents(plan, index, &dependents, &mut report);
                }
            }
        }

        // Anything still executing lost its task to a panic or abort
        let lost: Vec<usize> = (0..n)
            .filter(|&i| plan.partitions[i].status == PartitionStatus::Executing)
            .collect();
        for index in lost {
            let partition = &mut plan.partitions[index];
            partition.transition(PartitionStatus::Failed)?;
            report.failures.push(PartitionFailure {
                partition_id: partition.id.clone(),
                node_id: partition.node_id,
                sequence: index,
                error: CoordinatorError::Task("partition task aborted".to_string()),
            });
            skip_dependents(plan, index, &dependents, &mut report);
        }

        report.results = results.into_values().collect();
        info!(
            dispatched = group.spawned(),
            completed = report.results.len(),
            failed = report.failures.len(),
            "Plan execution settled"
        );
        Ok(report)
    }

    fn dispatch(
        &self,
        plan: &mut PartitionPlan,
        index: usize,
        template: &RequestTemplate,
        ctx: &ExecutionContext,
        group: &mut TaskGroup<(usize, Result<PartialResult>)>,
    ) -> Result<()> {
        let partition = &mut plan.partitions[index];
        partition.transition(PartitionStatus::Executing)?;

        let node = partition.node_id;
        let partition_id = partition.id.clone();
        let mut metadata = BTreeMap::new();
        metadata.insert("partition_id".to_string(), partition_id.clone());
        metadata.insert("inference_id".to_string(), ctx.inference_id.clone());

        let request = PartitionRequest {
            request_id: format!("{}_{}", ctx.inference_id, partition_id),
            model: template.model.clone(),
            prompt: template.prompt.clone(),
            parameters: template.parameters.clone(),
            partition_id: partition_id.clone(),
            layer_range: partition.layer_range,
            token_range: partition.token_range,
            metadata,
        };

        debug!(partition_id = %partition_id, node_id = %node, "Dispatching partition");

        let transport = self.transport.clone();
        let deadline = ctx.deadline;
        let timeout = ctx.timeout;
        let mut cancel = ctx.cancel.clone();
        let already_canceled = ctx.is_canceled();

        group.spawn(async move {
            if already_canceled {
                return (index, Err(CoordinatorError::Canceled));
            }

            let started = Instant::now();
            let response = tokio::select! {
                sent = tokio::time::timeout_at(deadline, transport.send_partition_request(&node, request)) => {
                    match sent {
                        Ok(response) => response,
                        Err(_) => Err(CoordinatorError::Timeout(timeout)),
                    }
                }
                _ = canceled(&mut cancel) => Err(CoordinatorError::Canceled),
            };
            let elapsed = started.elapsed();

            let outcome = response.map(|response| {
                let mut metadata = response.metadata;
                metadata.insert(
                    "remote_processing_ms".to_string(),
                    serde_json::json!(response.processing_time.as_millis() as u64),
                );
                PartialResult {
                    partition_id,
                    node_id: node,
                    sequence: index,
                    text: response.text,
                    payload: response.payload,
                    tokens: response.tokens,
                    logits: response.logits,
                    metadata,
                    processing_time: elapsed,
                    error: None,
                }
            });
            (index, outcome)
        });
        Ok(())
    }
}

/// Resolves once the cancel flag is set; never if the sender is gone
async fn canceled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Fail every pending partition downstream of `index`
fn skip_dependents(
    plan: &mut PartitionPlan,
    index: usize,
    dependents: &[Vec<usize>],
    report: &mut ExecutionReport,
) {
    let mut queue: VecDeque<(usize, usize)> =
        dependents[index].iter().map(|&d| (d, index)).collect();

    while let Some((next, cause)) = queue.pop_front() {
        if plan.partitions[next].status != PartitionStatus::Pending {
            continue;
        }
        let dependency = plan.partitions[cause].id.clone();
        let partition = &mut plan.partitions[next];
        // Pending -> Failed is always allowed
        let _ = partition.transition(PartitionStatus::Failed);
        debug!(partition_id = %partition.id, dependency = %dependency, "Skipping partition");

        report.failures.push(PartitionFailure {
            partition_id: partition.id.clone(),
            node_id: partition.node_id,
            sequence: next,
            error: CoordinatorError::DependencyFailed {
                partition_id: partition.id.clone(),
                dependency,
            },
        });
        queue.extend(dependents[next].iter().map(|&d| (d, next)));
    }
}
