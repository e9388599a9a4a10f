//! Supervision of long-running tasks that share one shutdown signal.
//!
//! Every task receives a clone of the supervisor's [`CancellationToken`]. The
//! first task to fail cancels the token, so its siblings drain and return.
//! [`Supervisor::wait`] collects every outcome and reports all failures
//! together.
//!
//! ```rust
//! use user_service_runtime::supervisor::Supervisor;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut supervisor = Supervisor::new(CancellationToken::new());
//! supervisor.spawn("worker", |cancel| async move {
//!     cancel.cancelled().await;
//!     Ok(())
//! });
//! supervisor.token().cancel();
//! supervisor.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One supervised task that did not finish cleanly.
#[derive(Debug)]
pub struct TaskFailure {
    /// Name the task was spawned with.
    pub name: &'static str,
    /// What went wrong.
    pub error: anyhow::Error,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.name, self.error)
    }
}

/// All failures of a supervised group.
#[derive(Debug, Error)]
#[error("{} supervised task(s) failed: {}", .failures.len(), join_failures(.failures))]
pub struct SupervisorError {
    /// Failures in completion order.
    pub failures: Vec<TaskFailure>,
}

fn join_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runs named tasks until all have returned.
pub struct Supervisor {
    token: CancellationToken,
    tasks: JoinSet<(&'static str, anyhow::Result<()>)>,
    names: HashMap<Id, &'static str>,
}

impl Supervisor {
    /// Create a supervisor whose tasks observe `token`.
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tasks: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    /// The shared shutdown token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Number of tasks still running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// `true` if no tasks are running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn `task` under `name`; it receives a clone of the shared token.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let future = task(self.token.clone());
        let handle = self.tasks.spawn(async move { (name, future.await) });
        self.names.insert(handle.id(), name);
        info!(task = name, "Task started");
    }

    /// Wait for every task to return.
    ///
    /// The first failure (error or panic) cancels the shared token.
    ///
    /// # Errors
    ///
    /// [`SupervisorError`] listing every task that failed.
    pub async fn wait(mut self) -> Result<(), SupervisorError> {
        let mut failures = Vec::new();

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!(task = name, "Task finished");
                    None
                }
                Ok((name, Err(error))) => Some(TaskFailure { name, error }),
                Err(join_error) => Some(TaskFailure {
                    name: self.names.get(&join_error.id()).copied().unwrap_or("unknown"),
                    error: anyhow::anyhow!("task aborted: {join_error}"),
                }),
            };

            if let Some(failure) = failure {
                error!(task = failure.name, error = %format!("{:#}", failure.error), "Task failed");
                self.token.cancel();
                failures.push(failure);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError { failures })
        }
    }
}
