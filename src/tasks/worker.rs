use std::{sync::Arc, time::Duration};

use super::{Task, TaskQueue};
use crate::outcome::{self, OutcomeReporter};
use crate::store::Store;
use crate::{dispatch, editor_link, sweep};

/// Executes tasks. Holds no per-task state, so one worker serves every
/// concurrent task.
pub struct Worker {
    pub store: Arc<dyn Store>,
    pub reporter: Arc<dyn OutcomeReporter>,
    pub http: reqwest::Client,
    pub report_outcome_delay: Duration,
    pub diff_sweep_budget: Duration,
}

impl Worker {
    pub async fn run(&self, task: &Task, queue: &dyn TaskQueue) -> anyhow::Result<()> {
        match *task {
            Task::ReportAttemptOutcome { attempt_id } => {
                outcome::report_attempt_outcome(
                    self.store.as_ref(),
                    self.reporter.as_ref(),
                    attempt_id,
                    self.report_outcome_delay,
                )
                .await?;
            }
            Task::ReportResourceScores { resource_id } => {
                dispatch::report_scores(self.store.as_ref(), queue, resource_id).await?;
            }
            Task::UpdateEditorLinkCache { editor_link_id } => {
                editor_link::update_cache(self.store.as_ref(), &self.http, editor_link_id).await?;
            }
            Task::DiffSuspendData => {
                sweep::diff_suspend_data(self.store.as_ref(), self.diff_sweep_budget).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attempt, CompletionStatus};
    use crate::outcome::{OutcomeError, OutcomeTarget};
    use crate::store::MemoryStore;
    use crate::tasks::RecordingQueue;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Unreachable;

    #[async_trait]
    impl OutcomeReporter for Unreachable {
        async fn report(&self, _: &OutcomeTarget, _: f64) -> Result<(), OutcomeError> {
            Err(OutcomeError::Unexpected(anyhow::anyhow!("not expected in this test")))
        }
    }

    fn worker(store: Arc<MemoryStore>) -> Worker {
        Worker {
            store,
            reporter: Arc::new(Unreachable),
            http: reqwest::Client::new(),
            report_outcome_delay: Duration::ZERO,
            diff_sweep_budget: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn resource_report_task_fans_out_per_attempt() {
        let store = Arc::new(MemoryStore::new());
        let r = store.add_resource("Quiz", "quiz", "Course");
        let u = store.add_user("bo", "Bo", "Peep");
        for _ in 0..2 {
            store.add_attempt(Attempt {
                id: 0,
                resource_id: r.id,
                user_id: u.id,
                exam_id: None,
                start_time: Utc::now(),
                end_time: None,
                completion_status: CompletionStatus::Incomplete,
                scaled_score: 0.0,
                raw_score: 0.0,
                max_score: 1.0,
                question_scores: vec![],
                diffed: false,
                broken: false,
            });
        }
        let queue = RecordingQueue::new();
        worker(store.clone())
            .run(&Task::ReportResourceScores { resource_id: r.id }, &queue)
            .await
            .unwrap();
        assert_eq!(queue.submitted().len(), 2);
    }

    #[tokio::test]
    async fn missing_attempt_is_a_task_failure() {
        let store = Arc::new(MemoryStore::new());
        let queue = RecordingQueue::new();
        let err = worker(store)
            .run(&Task::ReportAttemptOutcome { attempt_id: 404 }, &queue)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("attempt 404 not found"));
    }

    #[tokio::test]
    async fn unknown_editor_link_is_a_task_failure() {
        let store = Arc::new(MemoryStore::new());
        let queue = RecordingQueue::new();
        let err = worker(store)
            .run(&Task::UpdateEditorLinkCache { editor_link_id: 404 }, &queue)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("editor link 404 not found"));
        assert!(queue.submitted().is_empty());
    }
}
