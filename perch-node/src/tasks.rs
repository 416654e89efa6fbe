use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// How a tracked task ended during [`TaskRegistry::join_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Tasks that returned on their own within the grace period.
    pub joined: Vec<String>,
    /// Tasks that had to be aborted.
    pub aborted: Vec<String>,
    /// Tasks that panicked.
    pub panicked: Vec<String>,
}

/// Handles of every background task the supervisor started.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` on the runtime and track its handle.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.register(name, tokio::spawn(future));
    }

    /// Track a task that was spawned elsewhere.
    pub fn register(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        debug!(task = %name, "background task registered");
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every tracked task to finish, sharing one `grace` deadline.
    ///
    /// Tasks still running at the deadline are aborted. The registry is empty
    /// afterwards.
    pub async fn join_all(&mut self, grace: Duration) -> TaskReport {
        let deadline = Instant::now() + grace;
        let mut report = TaskReport::default();

        for (name, mut handle) in self.tasks.drain(..) {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(task = %name, "background task stopped");
                    report.joined.push(name);
                }
                Ok(Err(e)) if e.is_panic() => {
                    warn!(task = %name, "background task panicked: {}", e);
                    report.panicked.push(name);
                }
                Ok(Err(e)) => {
                    debug!(task = %name, "background task cancelled: {}", e);
                    report.aborted.push(name);
                }
                Err(_) => {
                    warn!(task = %name, ?grace, "background task did not stop in time, aborting");
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }
        report
    }
}
