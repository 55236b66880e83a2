mod common;

use async_trait::async_trait;
use lti_exam_runtime::dispatch::{current_report_process, report_scores};
use lti_exam_runtime::models::ReportProcessStatus;
use lti_exam_runtime::outcome::{
    report_attempt_outcome, OutcomeError, OutcomeReporter, OutcomeTarget, ReportStatus,
};
use lti_exam_runtime::store::{MemoryStore, Store};
use lti_exam_runtime::tasks::{RecordingQueue, Task};
use std::sync::Mutex;
use std::time::Duration;

use common::{attempt, launch_data, minutes};

enum Reply {
    Accept,
    Reject,
    Explode,
}

struct StubReporter {
    reply: Reply,
    seen: Mutex<Vec<(String, f64)>>,
}

impl StubReporter {
    fn new(reply: Reply) -> Self {
        StubReporter {
            reply,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OutcomeReporter for StubReporter {
    async fn report(&self, target: &OutcomeTarget, score: f64) -> Result<(), OutcomeError> {
        self.seen
            .lock()
            .unwrap()
            .push((target.sourcedid.clone(), score));
        match self.reply {
            Reply::Accept => Ok(()),
            Reply::Reject => Err(OutcomeError::Rejected("consumer said no".into())),
            Reply::Explode => Err(OutcomeError::Unexpected(anyhow::anyhow!("boom"))),
        }
    }
}

fn seeded() -> (MemoryStore, i64) {
    let store = MemoryStore::new();
    store.add_consumer("vle", "s3cret");
    let r = store.add_resource("Quiz", "quiz", "Course");
    let u = store.add_user("amy", "Amy", "Pond");
    store.add_user_data(launch_data(r.id, u.id));
    store.add_attempt(attempt(r.id, u.id, minutes(0), 0.8, 10.0));
    let latest = store.add_attempt(attempt(r.id, u.id, minutes(60), 0.4, 10.0));
    (store, latest.id)
}

#[tokio::test]
async fn reports_the_users_grade() {
    let (store, attempt_id) = seeded();
    let reporter = StubReporter::new(Reply::Accept);

    let status = report_attempt_outcome(&store, &reporter, attempt_id, Duration::ZERO)
        .await
        .unwrap();

    // highest grading is the default
    assert_eq!(status, ReportStatus::Reported { score: 0.8 });
    assert_eq!(*reporter.seen.lock().unwrap(), vec![("src-2".to_string(), 0.8)]);
}

#[tokio::test]
async fn rejected_report_is_dropped_quietly() {
    let (store, attempt_id) = seeded();
    let reporter = StubReporter::new(Reply::Reject);

    let status = report_attempt_outcome(&store, &reporter, attempt_id, Duration::ZERO)
        .await
        .unwrap();

    assert!(matches!(status, ReportStatus::Failed(reason) if reason.contains("consumer said no")));
}

#[tokio::test]
async fn unexpected_failure_propagates() {
    let (store, attempt_id) = seeded();
    let reporter = StubReporter::new(Reply::Explode);

    let err = report_attempt_outcome(&store, &reporter, attempt_id, Duration::ZERO)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("boom"));
}

#[tokio::test]
async fn no_launch_data_means_nothing_is_sent() {
    let store = MemoryStore::new();
    let r = store.add_resource("Quiz", "quiz", "Course");
    let u = store.add_user("rory", "Rory", "Williams");
    let a = store.add_attempt(attempt(r.id, u.id, minutes(0), 1.0, 5.0));
    let reporter = StubReporter::new(Reply::Accept);

    let status = report_attempt_outcome(&store, &reporter, a.id, Duration::ZERO)
        .await
        .unwrap();

    assert!(matches!(status, ReportStatus::Failed(_)));
    assert!(reporter.seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn waits_before_reporting() {
    let (store, attempt_id) = seeded();
    let reporter = StubReporter::new(Reply::Accept);
    let started = tokio::time::Instant::now();

    report_attempt_outcome(&store, &reporter, attempt_id, Duration::from_millis(100))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn bulk_report_queues_unbroken_attempts_and_completes() {
    let (store, _) = seeded();
    let mut broken = attempt(1, 2, minutes(90), 0.0, 10.0);
    broken.broken = true;
    let broken = store.add_attempt(broken);
    let queue = RecordingQueue::new();

    let process = report_scores(&store, &queue, 1).await.unwrap();

    assert_eq!(process.status, ReportProcessStatus::Complete);
    let submitted = queue.submitted();
    assert_eq!(submitted.len(), 2);
    assert!(!submitted.contains(&Task::ReportAttemptOutcome {
        attempt_id: broken.id
    }));
    let stored = store.report_processes(1).await.unwrap();
    assert_eq!(stored[0].status, ReportProcessStatus::Complete);
}

#[tokio::test]
async fn dismissing_hides_the_process_without_touching_it() {
    let (store, _) = seeded();
    let queue = RecordingQueue::new();
    let process = report_scores(&store, &queue, 1).await.unwrap();

    let view = current_report_process(&store.report_processes(1).await.unwrap());
    assert_eq!(view.last_report_process.map(|p| p.id), Some(process.id));

    let dismissed = store.dismiss_report_process(process.id).await.unwrap().unwrap();
    assert!(dismissed.dismissed);
    assert_eq!(dismissed.status, ReportProcessStatus::Complete);

    let view = current_report_process(&store.report_processes(1).await.unwrap());
    assert!(view.last_report_process.is_none());
    // finished processes are not surfaced once dismissed
    assert!(view.dismissed_report_process.is_none());
    assert_eq!(queue.submitted().len(), 2);
}
