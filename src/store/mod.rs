//! Persistence seam.
//!
//! Everything the flows and views need from the database goes through
//! [`Store`]. [`PgStore`] is the production implementation; [`MemoryStore`]
//! keeps the same semantics in process for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::*;

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Latest value and write time of one CMI key.
#[derive(serde::Serialize, Debug, Clone, PartialEq)]
pub struct CmiValue {
    pub value: String,
    pub time: f64,
}

#[async_trait]
pub trait Store: Send + Sync {
    // resources and exams
    async fn resource(&self, id: i64) -> StoreResult<Option<Resource>>;
    async fn exam(&self, id: i64) -> StoreResult<Option<Exam>>;
    async fn exams_for_resource(&self, resource_id: i64) -> StoreResult<Vec<Exam>>;
    async fn create_exam(&self, exam: NewExam) -> StoreResult<Exam>;
    async fn set_live_exam(&self, resource_id: i64, exam_id: i64) -> StoreResult<()>;
    /// Points every attempt of `resource_id` on `from` at `to`, all or nothing.
    async fn reassign_attempts_exam(
        &self,
        resource_id: i64,
        from: i64,
        to: i64,
    ) -> StoreResult<u64>;

    // users
    async fn user(&self, id: i64) -> StoreResult<Option<User>>;
    /// Distinct users with at least one attempt at the resource, by pk.
    async fn students(&self, resource_id: i64) -> StoreResult<Vec<User>>;
    async fn instructors(&self, resource_id: i64) -> StoreResult<Vec<User>>;
    async fn user_data(&self, resource_id: i64, user_id: i64)
        -> StoreResult<Option<LtiUserData>>;
    async fn consumer_secret(&self, consumer_key: &str) -> StoreResult<Option<String>>;

    // attempts
    async fn attempt(&self, id: i64) -> StoreResult<Option<Attempt>>;
    /// Attempts of a resource in natural order: start time, then pk.
    async fn attempts_for_resource(&self, resource_id: i64) -> StoreResult<Vec<Attempt>>;
    /// Attempts whose element history has not been compacted, oldest first.
    async fn undiffed_attempts(&self) -> StoreResult<Vec<Attempt>>;
    async fn scorm_elements(&self, attempt_id: i64) -> StoreResult<Vec<ScormElement>>;
    async fn scorm_element_diffs(&self, attempt_id: i64) -> StoreResult<Vec<ScormElementDiff>>;
    /// Writes `diffs` and flips `diffed` to true in one transaction, only if
    /// the attempt is still undiffed. Returns false when another sweep got
    /// there first, in which case nothing is written.
    async fn mark_diffed(&self, attempt_id: i64, diffs: &[ScormElementDiff]) -> StoreResult<bool>;
    /// Appends remarked elements for one attempt in one transaction and
    /// clears its `diffed` flag. Returns false if the attempt does not exist.
    async fn save_remarked_elements(
        &self,
        attempt_id: i64,
        remarked_by: i64,
        changed: &BTreeMap<String, String>,
        time: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // report processes
    async fn create_report_process(&self, resource_id: i64) -> StoreResult<ReportProcess>;
    async fn finish_report_process(
        &self,
        id: i64,
        status: ReportProcessStatus,
        response: Option<String>,
    ) -> StoreResult<()>;
    /// Newest first.
    async fn report_processes(&self, resource_id: i64) -> StoreResult<Vec<ReportProcess>>;
    async fn dismiss_report_process(&self, id: i64) -> StoreResult<Option<ReportProcess>>;

    // access tokens
    async fn grant_access_token(&self, resource_id: i64, user_id: i64) -> StoreResult<AccessToken>;
    /// Removes one token; false if the user had none.
    async fn revoke_access_token(&self, resource_id: i64, user_id: i64) -> StoreResult<bool>;
    async fn access_token_count(&self, resource_id: i64, user_id: i64) -> StoreResult<i64>;

    // discounted parts
    async fn discount_parts(&self, resource_id: i64) -> StoreResult<Vec<DiscountPart>>;
    async fn get_or_create_discount(
        &self,
        resource_id: i64,
        part: &str,
    ) -> StoreResult<(DiscountPart, bool)>;
    async fn update_discount(
        &self,
        id: i64,
        behaviour: DiscountBehaviour,
    ) -> StoreResult<Option<DiscountPart>>;
    async fn delete_discount(&self, id: i64) -> StoreResult<Option<DiscountPart>>;

    // access changes
    async fn access_changes(&self, resource_id: i64) -> StoreResult<Vec<AccessChange>>;
    async fn access_change(&self, id: i64) -> StoreResult<Option<AccessChange>>;
    async fn create_access_change(
        &self,
        resource_id: i64,
        req: &AccessChangeReq,
    ) -> StoreResult<AccessChange>;
    async fn update_access_change(
        &self,
        id: i64,
        req: &AccessChangeReq,
    ) -> StoreResult<Option<AccessChange>>;
    async fn delete_access_change(&self, id: i64) -> StoreResult<bool>;

    // editor links
    async fn editor_links(&self) -> StoreResult<Vec<EditorLink>>;
    async fn editor_link(&self, id: i64) -> StoreResult<Option<EditorLink>>;
    async fn save_editor_link_cache(
        &self,
        id: i64,
        available_exams: serde_json::Value,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Latest value of every CMI key, with the write time as epoch seconds.
///
/// Compacted elements carry no value of their own, but the latest element
/// of each key is never compacted, so only full values are read here.
pub fn scorm_cmi(elements: &[ScormElement]) -> BTreeMap<String, CmiValue> {
    let mut latest: BTreeMap<&str, &ScormElement> = BTreeMap::new();
    for e in elements {
        match latest.get(e.key.as_str()) {
            Some(cur) if (cur.time, cur.counter, cur.id) >= (e.time, e.counter, e.id) => {}
            _ => {
                latest.insert(&e.key, e);
            }
        }
    }
    latest
        .into_iter()
        .map(|(k, e)| {
            (
                k.to_string(),
                CmiValue {
                    value: e.value.clone(),
                    time: e.time.timestamp_millis() as f64 / 1000.0,
                },
            )
        })
        .collect()
}
