//! Reporting every attempt of a resource, tracked by a report process.

use serde::Serialize;

use crate::models::{ReportProcess, ReportProcessStatus};
use crate::store::{Store, StoreResult};
use crate::tasks::{Task, TaskQueue};

/// Opens a report process and queues one outcome report per unbroken
/// attempt. The process is complete once everything is queued; the reports
/// themselves run independently and are unaffected by dismissal.
pub async fn report_scores(
    store: &dyn Store,
    queue: &dyn TaskQueue,
    resource_id: i64,
) -> StoreResult<ReportProcess> {
    let process = store.create_report_process(resource_id).await?;

    let attempts = match store.attempts_for_resource(resource_id).await {
        Ok(attempts) => attempts,
        Err(e) => {
            store
                .finish_report_process(process.id, ReportProcessStatus::Error, Some(e.to_string()))
                .await?;
            return Err(e);
        }
    };

    let mut queued = 0;
    for attempt in attempts.iter().filter(|a| !a.broken) {
        queue.submit(Task::ReportAttemptOutcome {
            attempt_id: attempt.id,
        });
        queued += 1;
    }

    let response = format!("queued {queued} outcome reports");
    tracing::info!(resource = resource_id, process = process.id, queued, "dispatched score reports");
    store
        .finish_report_process(process.id, ReportProcessStatus::Complete, Some(response.clone()))
        .await?;
    Ok(ReportProcess {
        status: ReportProcessStatus::Complete,
        response: Some(response),
        ..process
    })
}

/// Which report process the dashboard shows.
#[derive(Serialize, Debug, Default, Clone)]
pub struct ReportProcessView {
    pub last_report_process: Option<ReportProcess>,
    pub dismissed_report_process: Option<ReportProcess>,
}

/// Only the newest process is ever shown: as the current one while not
/// dismissed, or separately when dismissed but still reporting.
pub fn current_report_process(processes_newest_first: &[ReportProcess]) -> ReportProcessView {
    let mut view = ReportProcessView::default();
    if let Some(last) = processes_newest_first.first() {
        if !last.dismissed {
            view.last_report_process = Some(last.clone());
        } else if last.status == ReportProcessStatus::Reporting {
            view.dismissed_report_process = Some(last.clone());
        }
    }
    view
}
