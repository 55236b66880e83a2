//! Remarking: handing stored attempt state to a headless exam runner, and
//! saving the keys it changed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::RemarkSaveReq;
use crate::store::{scorm_cmi, CmiValue, Store, StoreError};

/// Keys forced on every snapshot so the runner resumes the attempt in review mode.
const REVIEW_OVERRIDES: [(&str, &str); 3] = [
    ("cmi.mode", "review"),
    ("cmi.entry", "resume"),
    ("numbas.user_role", "student"),
];

#[derive(Serialize, Debug, Clone)]
pub struct AttemptCmi {
    pub pk: i64,
    pub cmi: BTreeMap<String, CmiValue>,
}

/// CMI state of each requested attempt belonging to `resource_id`, in the
/// order requested. Unknown or foreign attempts are left out.
pub async fn attempt_cmis(
    store: &dyn Store,
    resource_id: i64,
    attempt_pks: &[i64],
    now: DateTime<Utc>,
) -> Result<Vec<AttemptCmi>, StoreError> {
    let etime = now.timestamp_millis() as f64 / 1000.0;
    let mut out = Vec::with_capacity(attempt_pks.len());
    for &pk in attempt_pks {
        match store.attempt(pk).await? {
            Some(a) if a.resource_id == resource_id => {}
            _ => continue,
        }
        let mut cmi = scorm_cmi(&store.scorm_elements(pk).await?);
        for (key, value) in REVIEW_OVERRIDES {
            cmi.insert(
                key.to_string(),
                CmiValue {
                    value: value.to_string(),
                    time: etime,
                },
            );
        }
        out.push(AttemptCmi { pk, cmi });
    }
    Ok(out)
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RemarkSaveOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub saved: Vec<i64>,
}

/// Saves each attempt's changed keys in its own transaction.
///
/// Attempts that do not exist, or belong to another resource, are skipped
/// and make the outcome unsuccessful. A store failure stops the save;
/// attempts saved before it stay saved and are listed in the outcome.
pub async fn save_changed_data(
    store: &dyn Store,
    resource_id: i64,
    remarked_by: i64,
    req: &RemarkSaveReq,
    now: DateTime<Utc>,
) -> RemarkSaveOutcome {
    let mut saved = Vec::new();
    for attempt in &req.attempts {
        let result = match store.attempt(attempt.pk).await {
            Ok(Some(a)) if a.resource_id == resource_id => {
                store
                    .save_remarked_elements(attempt.pk, remarked_by, &attempt.changed_keys, now)
                    .await
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => saved.push(attempt.pk),
            Ok(false) => {
                tracing::warn!(attempt = attempt.pk, "remarked data for unknown attempt");
            }
            Err(e) => {
                tracing::error!(attempt = attempt.pk, error = %e, "saving remarked data failed");
                return RemarkSaveOutcome {
                    success: false,
                    message: Some(e.to_string()),
                    saved,
                };
            }
        }
    }
    if saved.len() < req.attempts.len() {
        return RemarkSaveOutcome {
            success: false,
            message: Some("There was an error while saving some data.".into()),
            saved,
        };
    }
    RemarkSaveOutcome {
        success: true,
        message: None,
        saved,
    }
}
