//! Supervised background tasks
//!
//! Every task gets its own shutdown channel, so loops can be stopped one at
//! a time or all together. Stopping waits for the task's current iteration
//! to finish and aborts it only if it overruns the grace period.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Resolves once the owning supervisor asks the task to stop
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    pub async fn recv(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            // A dropped sender means the supervisor is gone
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

struct SupervisedTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Mutex<HashMap<String, SupervisedTask>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` under `name`; returns false if it is already running
    pub async fn spawn<F, Fut>(&self, name: &str, task: F) -> bool
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(name) {
            if !existing.handle.is_finished() {
                return false;
            }
        }

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(task(ShutdownSignal(rx)));
        tasks.insert(name.to_string(), SupervisedTask { shutdown, handle });
        debug!(task = %name, "Task started");
        true
    }

    /// Stop one task and wait for it; returns false if it was not running
    pub async fn stop(&self, name: &str) -> bool {
        let task = self.tasks.lock().await.remove(name);
        match task {
            Some(task) => {
                shutdown_task(name, task).await;
                true
            }
            None => false,
        }
    }

    /// Stop every task and wait for all of them
    pub async fn stop_all(&self) {
        let tasks: Vec<(String, SupervisedTask)> = self.tasks.lock().await.drain().collect();
        if tasks.is_empty() {
            return;
        }
        for (_, task) in &tasks {
            task.shutdown.send_replace(true);
        }
        let count = tasks.len();
        futures::future::join_all(
            tasks
                .into_iter()
                .map(|(name, task)| async move { shutdown_task(&name, task).await }),
        )
        .await;
        info!(tasks = count, "All supervised tasks stopped");
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(name)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Names of live tasks, sorted
    pub async fn running(&self) -> Vec<String> {
        let tasks = self.tasks.lock().await;
        let mut names: Vec<String> = tasks
            .iter()
            .filter(|(_, t)| !t.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

async fn shutdown_task(name: &str, task: SupervisedTask) {
    task.shutdown.send_replace(true);
    let mut handle = task.handle;
    match tokio::time::timeout(STOP_GRACE, &mut handle).await {
        Ok(Ok(())) => debug!(task = %name, "Task stopped"),
        Ok(Err(e)) if e.is_panic() => warn!(task = %name, "Task panicked"),
        Ok(Err(_)) => {}
        Err(_) => {
            warn!(task = %name, "Task overran shutdown grace period, aborting");
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Run `tick` every period until shutdown
///
/// The period is re-read from `config` whenever it changes, so a hot reload
/// takes effect without restarting the loop. A tick in progress always
/// completes before shutdown is observed.
pub async fn run_every<C, P, F, Fut>(
    name: &'static str,
    mut config: watch::Receiver<C>,
    period_of: P,
    mut shutdown: ShutdownSignal,
    mut tick: F,
) where
    C: Send + Sync,
    P: Fn(&C) -> Duration,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let period = period_of(&*config.borrow_and_update());
        debug!(task = name, period = ?period, "Waiting for next tick");

        tokio::select! {
            _ = shutdown.recv() => break,
            changed = config.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(period) => tick().await,
        }
    }
    debug!(task = name, "Loop exited");
}
