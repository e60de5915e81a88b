use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::Instrument as _;

/// Detached background work with a concurrency bound and a time cap.
///
/// Tasks are not tied to the request which spawned them, so a client hanging
/// up does not stop them.
#[derive(Debug, Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    max_duration: Duration,
}

impl TaskPool {
    /// A pool running at most `max_concurrent` tasks, each for at most `max_duration`.
    pub fn new(max_concurrent: usize, max_duration: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            max_duration,
        }
    }

    async fn run<F>(max_duration: Duration, task: F)
    where
        F: Future<Output = ()>,
    {
        if tokio::time::timeout(max_duration, task).await.is_err() {
            tracing::warn!(?max_duration, "background task ran out of time");
        }
    }

    /// Run `task` once a slot is free.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let max_duration = self.max_duration;
        self.tracker.spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                Self::run(max_duration, task).await;
            }
            .instrument(tracing::info_span!("task", name)),
        );
    }

    /// Run `task` only if a slot is free right now; otherwise hand it back.
    pub fn try_spawn<F>(&self, name: &'static str, task: F) -> Result<(), F>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::debug!(name, "task pool is full");
            return Err(task);
        };
        let max_duration = self.max_duration;
        self.tracker.spawn(
            async move {
                let _permit = permit;
                Self::run(max_duration, task).await;
            }
            .instrument(tracing::info_span!("task", name)),
        );
        Ok(())
    }

    /// Tasks spawned and not yet finished.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Whether no task is running.
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait until every task (including ones spawned meanwhile) has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
