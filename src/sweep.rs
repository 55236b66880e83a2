//! Periodic compaction of suspend-data histories.

use std::time::Duration;
use tokio::time::Instant;

use crate::scorm_diff;
use crate::store::{Store, StoreResult};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    /// Attempts this sweep compacted and marked diffed.
    pub diffed: usize,
    /// Attempts another sweep marked first; nothing was written for them.
    pub lost_race: usize,
    /// Attempts whose history could not be replayed; left for a later sweep.
    pub unreadable: usize,
    /// Pending attempts not reached before the budget ran out.
    pub remaining: usize,
}

/// Compacts every undiffed attempt, oldest first, until `budget` has passed.
///
/// The budget is checked after each attempt, so one attempt is always
/// finished once started. Whatever is left stays undiffed for the next run.
pub async fn diff_suspend_data(store: &dyn Store, budget: Duration) -> StoreResult<SweepSummary> {
    let start = Instant::now();
    let pending = store.undiffed_attempts().await?;
    let mut summary = SweepSummary::default();
    if pending.is_empty() {
        tracing::debug!("no attempts to diff");
        return Ok(summary);
    }

    let total = pending.len();
    for (i, attempt) in pending.iter().enumerate() {
        let elements = store.scorm_elements(attempt.id).await?;
        let existing = store.scorm_element_diffs(attempt.id).await?;
        match scorm_diff::compact(&elements, &existing) {
            Ok(diffs) => {
                if store.mark_diffed(attempt.id, &diffs).await? {
                    summary.diffed += 1;
                } else {
                    summary.lost_race += 1;
                }
            }
            Err(e) => {
                tracing::warn!(attempt = attempt.id, error = %e, "cannot replay element history");
                summary.unreadable += 1;
            }
        }
        if start.elapsed() > budget {
            summary.remaining = total - i - 1;
            break;
        }
    }

    tracing::info!(
        diffed = summary.diffed,
        lost_race = summary.lost_race,
        remaining = summary.remaining,
        "suspend data sweep finished"
    );
    Ok(summary)
}
