//! Wait-all barrier over spawned tasks
//!
//! Every fan-out in the crate goes through [`TaskGroup`]: tasks are spawned
//! into a `JoinSet`, joined one by one as they settle, and aborted if the
//! group is dropped early. Nothing spawned through a group outlives it.

use crate::errors::{CoordinatorError, Result};
use std::future::Future;
use tokio::task::{JoinError, JoinSet};

pub struct TaskGroup<T> {
    set: JoinSet<T>,
    spawned: usize,
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            spawned: 0,
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.spawned += 1;
        self.set.spawn(task);
    }

    /// Tasks spawned over the group's lifetime
    pub fn spawned(&self) -> usize {
        self.spawned
    }

    /// Tasks not yet joined
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Next task to settle, `None` once the group is drained
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.set
            .join_next()
            .await
            .map(|joined| joined.map_err(task_error))
    }

    /// Wait for every task and return their outputs in completion order
    pub async fn wait_all(mut self) -> Vec<Result<T>> {
        let mut outputs = Vec::with_capacity(self.set.len());
        while let Some(output) = self.next().await {
            outputs.push(output);
        }
        outputs
    }

    /// Wait for every task; the first error wins, the rest still settle
    pub async fn try_wait_all(self) -> Result<Vec<T>> {
        let mut first_error = None;
        let mut values = Vec::new();
        for output in self.wait_all().await {
            match output {
                Ok(value) => values.push(value),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }

    /// Abort everything still running and wait for it to stop
    pub async fn shutdown(&mut self) {
        self.set.shutdown().await;
    }
}

fn task_error(e: JoinError) -> CoordinatorError {
    if e.is_cancelled() {
        CoordinatorError::Canceled
    } else {
        CoordinatorError::Task(e.to_string())
    }
}
