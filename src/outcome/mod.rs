//! Sending a student's grade back to the LTI consumer.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Attempt, GradingMethod};
use crate::store::Store;

mod lti;
pub mod oauth;

pub use lti::LtiOutcomeReporter;

/// Where and how to deliver one user's outcome.
#[derive(Debug, Clone)]
pub struct OutcomeTarget {
    pub service_url: String,
    pub sourcedid: String,
    pub consumer_key: String,
    pub consumer_secret: String,
}

#[derive(Error, Debug)]
pub enum OutcomeError {
    /// The consumer could not be reached or refused the result. Expected
    /// from time to time; callers drop the report.
    #[error("outcome not accepted: {0}")]
    Rejected(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

#[async_trait]
pub trait OutcomeReporter: Send + Sync {
    async fn report(&self, target: &OutcomeTarget, score: f64) -> Result<(), OutcomeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    Reported { score: f64 },
    Failed(String),
}

/// The score a user gets for a resource, over their unbroken attempts.
pub fn grade_user(attempts: &[Attempt], method: GradingMethod) -> f64 {
    let mut unbroken = attempts.iter().filter(|a| !a.broken);
    match method {
        GradingMethod::Highest => unbroken.map(|a| a.scaled_score).fold(0.0, f64::max),
        GradingMethod::Last => unbroken
            .max_by_key(|a| (a.start_time, a.id))
            .map(|a| a.scaled_score)
            .unwrap_or(0.0),
    }
}

/// Reports the outcome of the user who made `attempt_id`.
///
/// Waits `delay` first so bulk reporting does not flood the consumer. A
/// rejected report comes back as [`ReportStatus::Failed`] and is not
/// retried; anything else is an error for the task runner to surface.
pub async fn report_attempt_outcome(
    store: &dyn Store,
    reporter: &dyn OutcomeReporter,
    attempt_id: i64,
    delay: Duration,
) -> anyhow::Result<ReportStatus> {
    tokio::time::sleep(delay).await;

    let attempt = store
        .attempt(attempt_id)
        .await?
        .with_context(|| format!("attempt {attempt_id} not found"))?;
    let resource = store
        .resource(attempt.resource_id)
        .await?
        .with_context(|| format!("resource {} not found", attempt.resource_id))?;

    let target = match outcome_target(store, &attempt).await? {
        Ok(target) => target,
        Err(reason) => {
            tracing::warn!(attempt = attempt_id, %reason, "outcome not reported");
            return Ok(ReportStatus::Failed(reason));
        }
    };

    let attempts: Vec<Attempt> = store
        .attempts_for_resource(resource.id)
        .await?
        .into_iter()
        .filter(|a| a.user_id == attempt.user_id)
        .collect();
    let score = grade_user(&attempts, resource.grading_method);

    match reporter.report(&target, score).await {
        Ok(()) => {
            tracing::info!(attempt = attempt_id, user = attempt.user_id, score, "reported outcome");
            Ok(ReportStatus::Reported { score })
        }
        Err(OutcomeError::Rejected(reason)) => {
            tracing::warn!(attempt = attempt_id, %reason, "outcome report failed");
            Ok(ReportStatus::Failed(reason))
        }
        Err(OutcomeError::Unexpected(e)) => {
            Err(e.context(format!("reporting outcome of attempt {attempt_id}")))
        }
    }
}

async fn outcome_target(
    store: &dyn Store,
    attempt: &Attempt,
) -> anyhow::Result<Result<OutcomeTarget, String>> {
    let Some(data) = store.user_data(attempt.resource_id, attempt.user_id).await? else {
        return Ok(Err("no LTI launch data for user".into()));
    };
    let (Some(service_url), Some(sourcedid)) = (
        data.lis_outcome_service_url.filter(|s| !s.is_empty()),
        data.lis_result_sourcedid.filter(|s| !s.is_empty()),
    ) else {
        return Ok(Err("consumer did not provide an outcome service".into()));
    };
    let Some(consumer_key) = data.consumer_key else {
        return Ok(Err("launch has no consumer key".into()));
    };
    let consumer_secret = store
        .consumer_secret(&consumer_key)
        .await?
        .ok_or_else(|| anyhow!("unknown LTI consumer {consumer_key:?}"))?;
    Ok(Ok(OutcomeTarget {
        service_url,
        sourcedid,
        consumer_key,
        consumer_secret,
    }))
}
