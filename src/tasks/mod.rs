//! Background work: what can be queued, and the queue interface the rest of
//! the crate submits through.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

mod queue;
mod schedule;
mod worker;

pub use queue::TokioTaskQueue;
pub use schedule::{Schedule, ScheduleError};
pub use worker::Worker;

/// A unit of background work. Entities are passed by primary key and
/// re-read when the task runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    ReportAttemptOutcome { attempt_id: i64 },
    ReportResourceScores { resource_id: i64 },
    UpdateEditorLinkCache { editor_link_id: i64 },
    DiffSuspendData,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::ReportAttemptOutcome { .. } => "report_attempt_outcome",
            Task::ReportResourceScores { .. } => "report_resource_scores",
            Task::UpdateEditorLinkCache { .. } => "update_editor_link_cache",
            Task::DiffSuspendData => "diff_suspend_data",
        }
    }
}

pub trait TaskQueue: Send + Sync {
    /// Hands `task` off for out-of-band execution and returns immediately.
    fn submit(&self, task: Task);
    /// Runs `task` every time `schedule` fires, until shutdown.
    fn schedule(&self, schedule: Schedule, task: Task);
}

/// Registers the service's recurring work on `queue`.
pub fn schedule_recurring(queue: &dyn TaskQueue, diff_sweep: Schedule) {
    queue.schedule(diff_sweep, Task::DiffSuspendData);
}

/// Queue that only remembers what it was given. Lets callers check what
/// would have been enqueued without running anything.
#[derive(Default)]
pub struct RecordingQueue {
    submitted: Mutex<Vec<Task>>,
    scheduled: Mutex<Vec<(Schedule, Task)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<Task> {
        self.submitted
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn scheduled(&self) -> Vec<(Schedule, Task)> {
        self.scheduled
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

impl TaskQueue for RecordingQueue {
    fn submit(&self, task: Task) {
        if let Ok(mut tasks) = self.submitted.lock() {
            tasks.push(task);
        }
    }

    fn schedule(&self, schedule: Schedule, task: Task) {
        if let Ok(mut tasks) = self.scheduled.lock() {
            tasks.push((schedule, task));
        }
    }
}
