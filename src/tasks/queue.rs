use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::Instrument;

use super::{Schedule, Task, TaskQueue, Worker};

struct Inner {
    worker: Worker,
    slots: Semaphore,
}

/// Runs tasks on the tokio runtime, at most `workers` at a time.
///
/// Failures are logged here and go no further: whoever submitted the task
/// has already moved on.
#[derive(Clone)]
pub struct TokioTaskQueue {
    inner: Arc<Inner>,
}

impl TokioTaskQueue {
    pub fn new(worker: Worker, workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                worker,
                slots: Semaphore::new(workers.max(1)),
            }),
        }
    }

    async fn execute(&self, task: Task) {
        let Ok(_slot) = self.inner.slots.acquire().await else {
            tracing::warn!(task = task.name(), "task queue closed, dropping task");
            return;
        };
        let span = tracing::info_span!("task", name = task.name());
        let result = self.inner.worker.run(&task, self).instrument(span).await;
        if let Err(e) = result {
            tracing::error!(task = ?task, error = ?e, "task failed");
        }
    }
}

impl TaskQueue for TokioTaskQueue {
    fn submit(&self, task: Task) {
        tracing::debug!(task = ?task, "queued");
        let this = self.clone();
        tokio::spawn(async move { this.execute(task).await });
    }

    fn schedule(&self, schedule: Schedule, task: Task) {
        tracing::info!(task = task.name(), %schedule, "scheduled");
        let this = self.clone();
        tokio::spawn(async move {
            let period = schedule.period();
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                this.execute(task.clone()).await;
            }
        });
    }
}
