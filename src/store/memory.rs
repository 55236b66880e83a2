use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{Store, StoreError, StoreResult};
use crate::models::*;

#[derive(Default)]
struct State {
    next_id: i64,
    resources: BTreeMap<i64, Resource>,
    exams: BTreeMap<i64, Exam>,
    users: BTreeMap<i64, User>,
    user_data: Vec<LtiUserData>,
    consumers: HashMap<String, String>,
    attempts: BTreeMap<i64, Attempt>,
    elements: BTreeMap<i64, ScormElement>,
    diffs: BTreeMap<i64, ScormElementDiff>,
    remarked: BTreeMap<i64, i64>,
    report_processes: BTreeMap<i64, ReportProcess>,
    access_tokens: BTreeMap<i64, AccessToken>,
    discounts: BTreeMap<i64, DiscountPart>,
    access_changes: BTreeMap<i64, AccessChange>,
    editor_links: BTreeMap<i64, EditorLink>,
    failing_attempts: HashSet<i64>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process [`Store`] with the same ordering and transaction semantics as
/// [`super::PgStore`]. Every method holds one lock for its whole body, which
/// stands in for a database transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    read_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_user(&self, username: &str, first_name: &str, last_name: &str) -> User {
        let mut s = self.lock();
        let user = User {
            id: s.id(),
            username: username.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: format!("{username}@example.com"),
        };
        s.users.insert(user.id, user.clone());
        user
    }

    pub fn add_resource(&self, title: &str, slug: &str, context_name: &str) -> Resource {
        let mut s = self.lock();
        let resource = Resource {
            id: s.id(),
            title: title.to_string(),
            slug: slug.to_string(),
            context_name: context_name.to_string(),
            exam_id: None,
            grading_method: GradingMethod::Highest,
            max_attempts: 0,
        };
        s.resources.insert(resource.id, resource.clone());
        resource
    }

    pub fn set_grading_method(&self, resource_id: i64, method: GradingMethod) {
        if let Some(r) = self.lock().resources.get_mut(&resource_id) {
            r.grading_method = method;
        }
    }

    pub fn add_user_data(&self, data: LtiUserData) {
        self.lock().user_data.push(data);
    }

    pub fn add_consumer(&self, key: &str, secret: &str) {
        self.lock()
            .consumers
            .insert(key.to_string(), secret.to_string());
    }

    /// Inserts an attempt; `id` is assigned by the store.
    pub fn add_attempt(&self, mut attempt: Attempt) -> Attempt {
        let mut s = self.lock();
        attempt.id = s.id();
        s.attempts.insert(attempt.id, attempt.clone());
        attempt
    }

    pub fn remove_attempt(&self, id: i64) {
        let mut s = self.lock();
        s.attempts.remove(&id);
        s.elements.retain(|_, e| e.attempt_id != id);
    }

    pub fn add_element(&self, attempt_id: i64, key: &str, value: &str, time: DateTime<Utc>) -> ScormElement {
        let mut s = self.lock();
        let counter = s
            .elements
            .values()
            .filter(|e| e.attempt_id == attempt_id && e.key == key)
            .count() as i32;
        let element = ScormElement {
            id: s.id(),
            attempt_id,
            key: key.to_string(),
            value: value.to_string(),
            time,
            counter,
        };
        s.elements.insert(element.id, element.clone());
        element
    }

    pub fn add_editor_link(&self, name: &str, url: &str) -> EditorLink {
        let mut s = self.lock();
        let link = EditorLink {
            id: s.id(),
            name: name.to_string(),
            url: url.to_string(),
            cached_available_exams: serde_json::json!([]),
            last_cache_update: None,
        };
        s.editor_links.insert(link.id, link.clone());
        link
    }

    /// Makes every later write touching `attempt_id` fail.
    pub fn fail_writes_for(&self, attempt_id: i64) {
        self.lock().failing_attempts.insert(attempt_id);
    }

    pub fn remarked_by(&self, element_id: i64) -> Option<i64> {
        self.lock().remarked.get(&element_id).copied()
    }

    /// Makes every element history read take `delay`, like a slow database.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    pub fn access_token_total(&self) -> usize {
        self.lock().access_tokens.len()
    }
}

fn attempt_order(a: &Attempt) -> (DateTime<Utc>, i64) {
    (a.start_time, a.id)
}

#[async_trait]
impl Store for MemoryStore {
    async fn resource(&self, id: i64) -> StoreResult<Option<Resource>> {
        Ok(self.lock().resources.get(&id).cloned())
    }

    async fn exam(&self, id: i64) -> StoreResult<Option<Exam>> {
        Ok(self.lock().exams.get(&id).cloned())
    }

    async fn exams_for_resource(&self, resource_id: i64) -> StoreResult<Vec<Exam>> {
        let mut exams: Vec<Exam> = self
            .lock()
            .exams
            .values()
            .filter(|e| e.resource_id == Some(resource_id))
            .cloned()
            .collect();
        exams.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(exams)
    }

    async fn create_exam(&self, exam: NewExam) -> StoreResult<Exam> {
        let mut s = self.lock();
        let exam = Exam {
            id: s.id(),
            title: exam.title,
            resource_id: Some(exam.resource_id),
            launch_href: exam.launch_href,
            base_path: exam.base_path,
            created_at: Utc::now(),
        };
        s.exams.insert(exam.id, exam.clone());
        Ok(exam)
    }

    async fn set_live_exam(&self, resource_id: i64, exam_id: i64) -> StoreResult<()> {
        if let Some(r) = self.lock().resources.get_mut(&resource_id) {
            r.exam_id = Some(exam_id);
        }
        Ok(())
    }

    async fn reassign_attempts_exam(&self, resource_id: i64, from: i64, to: i64) -> StoreResult<u64> {
        let mut s = self.lock();
        let ids: Vec<i64> = s
            .attempts
            .values()
            .filter(|a| a.resource_id == resource_id && a.exam_id == Some(from))
            .map(|a| a.id)
            .collect();
        if let Some(bad) = ids.iter().find(|id| s.failing_attempts.contains(id)) {
            return Err(StoreError::Unavailable(format!("attempt {bad} is locked")));
        }
        for id in &ids {
            if let Some(a) = s.attempts.get_mut(id) {
                a.exam_id = Some(to);
            }
        }
        Ok(ids.len() as u64)
    }

    async fn user(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn students(&self, resource_id: i64) -> StoreResult<Vec<User>> {
        let s = self.lock();
        let ids: BTreeSet<i64> = s
            .attempts
            .values()
            .filter(|a| a.resource_id == resource_id)
            .map(|a| a.user_id)
            .collect();
        Ok(ids.iter().filter_map(|id| s.users.get(id).cloned()).collect())
    }

    async fn instructors(&self, resource_id: i64) -> StoreResult<Vec<User>> {
        let s = self.lock();
        let ids: BTreeSet<i64> = s
            .user_data
            .iter()
            .filter(|d| d.resource_id == resource_id && d.is_instructor)
            .map(|d| d.user_id)
            .collect();
        Ok(ids.iter().filter_map(|id| s.users.get(id).cloned()).collect())
    }

    async fn user_data(&self, resource_id: i64, user_id: i64) -> StoreResult<Option<LtiUserData>> {
        Ok(self
            .lock()
            .user_data
            .iter()
            .rev()
            .find(|d| d.resource_id == resource_id && d.user_id == user_id)
            .cloned())
    }

    async fn consumer_secret(&self, consumer_key: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().consumers.get(consumer_key).cloned())
    }

    async fn attempt(&self, id: i64) -> StoreResult<Option<Attempt>> {
        Ok(self.lock().attempts.get(&id).cloned())
    }

    async fn attempts_for_resource(&self, resource_id: i64) -> StoreResult<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .lock()
            .attempts
            .values()
            .filter(|a| a.resource_id == resource_id)
            .cloned()
            .collect();
        attempts.sort_by_key(attempt_order);
        Ok(attempts)
    }

    async fn undiffed_attempts(&self) -> StoreResult<Vec<Attempt>> {
        let mut attempts: Vec<Attempt> = self
            .lock()
            .attempts
            .values()
            .filter(|a| !a.diffed)
            .cloned()
            .collect();
        attempts.sort_by_key(attempt_order);
        Ok(attempts)
    }

    async fn scorm_elements(&self, attempt_id: i64) -> StoreResult<Vec<ScormElement>> {
        let delay = *self.read_delay.lock().unwrap_or_else(|p| p.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut elements: Vec<ScormElement> = self
            .lock()
            .elements
            .values()
            .filter(|e| e.attempt_id == attempt_id)
            .cloned()
            .collect();
        elements.sort_by_key(|e| (e.time, e.counter, e.id));
        Ok(elements)
    }

    async fn scorm_element_diffs(&self, attempt_id: i64) -> StoreResult<Vec<ScormElementDiff>> {
        let s = self.lock();
        Ok(s.diffs
            .values()
            .filter(|d| {
                s.elements
                    .get(&d.element_id)
                    .is_some_and(|e| e.attempt_id == attempt_id)
            })
            .cloned()
            .collect())
    }

    async fn mark_diffed(&self, attempt_id: i64, diffs: &[ScormElementDiff]) -> StoreResult<bool> {
        let mut s = self.lock();
        if s.failing_attempts.contains(&attempt_id) {
            return Err(StoreError::Unavailable(format!("attempt {attempt_id} is locked")));
        }
        match s.attempts.get_mut(&attempt_id) {
            Some(a) if !a.diffed => a.diffed = true,
            _ => return Ok(false),
        }
        for d in diffs {
            s.diffs.insert(d.element_id, d.clone());
            if let Some(e) = s.elements.get_mut(&d.element_id) {
                e.value.clear();
            }
        }
        Ok(true)
    }

    async fn save_remarked_elements(
        &self,
        attempt_id: i64,
        remarked_by: i64,
        changed: &BTreeMap<String, String>,
        time: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut s = self.lock();
        if s.failing_attempts.contains(&attempt_id) {
            return Err(StoreError::Unavailable(format!("attempt {attempt_id} is locked")));
        }
        if !s.attempts.contains_key(&attempt_id) {
            return Ok(false);
        }
        for (key, value) in changed {
            let element = ScormElement {
                id: s.id(),
                attempt_id,
                key: key.clone(),
                value: value.clone(),
                time,
                counter: 0,
            };
            s.remarked.insert(element.id, remarked_by);
            s.elements.insert(element.id, element);
        }
        if let Some(a) = s.attempts.get_mut(&attempt_id) {
            a.diffed = false;
        }
        Ok(true)
    }

    async fn create_report_process(&self, resource_id: i64) -> StoreResult<ReportProcess> {
        let mut s = self.lock();
        let process = ReportProcess {
            id: s.id(),
            resource_id,
            status: ReportProcessStatus::Reporting,
            response: None,
            dismissed: false,
            started_at: Utc::now(),
        };
        s.report_processes.insert(process.id, process.clone());
        Ok(process)
    }

    async fn finish_report_process(
        &self,
        id: i64,
        status: ReportProcessStatus,
        response: Option<String>,
    ) -> StoreResult<()> {
        if let Some(p) = self.lock().report_processes.get_mut(&id) {
            p.status = status;
            p.response = response;
        }
        Ok(())
    }

    async fn report_processes(&self, resource_id: i64) -> StoreResult<Vec<ReportProcess>> {
        let mut processes: Vec<ReportProcess> = self
            .lock()
            .report_processes
            .values()
            .filter(|p| p.resource_id == resource_id)
            .cloned()
            .collect();
        processes.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));
        Ok(processes)
    }

    async fn dismiss_report_process(&self, id: i64) -> StoreResult<Option<ReportProcess>> {
        Ok(self.lock().report_processes.get_mut(&id).map(|p| {
            p.dismissed = true;
            p.clone()
        }))
    }

    async fn grant_access_token(&self, resource_id: i64, user_id: i64) -> StoreResult<AccessToken> {
        let mut s = self.lock();
        let token = AccessToken {
            id: s.id(),
            resource_id,
            user_id,
            created_at: Utc::now(),
        };
        s.access_tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn revoke_access_token(&self, resource_id: i64, user_id: i64) -> StoreResult<bool> {
        let mut s = self.lock();
        let first = s
            .access_tokens
            .values()
            .find(|t| t.resource_id == resource_id && t.user_id == user_id)
            .map(|t| t.id);
        Ok(first.and_then(|id| s.access_tokens.remove(&id)).is_some())
    }

    async fn access_token_count(&self, resource_id: i64, user_id: i64) -> StoreResult<i64> {
        Ok(self
            .lock()
            .access_tokens
            .values()
            .filter(|t| t.resource_id == resource_id && t.user_id == user_id)
            .count() as i64)
    }

    async fn discount_parts(&self, resource_id: i64) -> StoreResult<Vec<DiscountPart>> {
        let mut parts: Vec<DiscountPart> = self
            .lock()
            .discounts
            .values()
            .filter(|d| d.resource_id == resource_id)
            .cloned()
            .collect();
        parts.sort_by(|a, b| a.part.cmp(&b.part));
        Ok(parts)
    }

    async fn get_or_create_discount(
        &self,
        resource_id: i64,
        part: &str,
    ) -> StoreResult<(DiscountPart, bool)> {
        let mut s = self.lock();
        if let Some(d) = s
            .discounts
            .values()
            .find(|d| d.resource_id == resource_id && d.part == part)
        {
            return Ok((d.clone(), false));
        }
        let discount = DiscountPart {
            id: s.id(),
            resource_id,
            part: part.to_string(),
            behaviour: DiscountBehaviour::Remove,
        };
        s.discounts.insert(discount.id, discount.clone());
        Ok((discount, true))
    }

    async fn update_discount(
        &self,
        id: i64,
        behaviour: DiscountBehaviour,
    ) -> StoreResult<Option<DiscountPart>> {
        Ok(self.lock().discounts.get_mut(&id).map(|d| {
            d.behaviour = behaviour;
            d.clone()
        }))
    }

    async fn delete_discount(&self, id: i64) -> StoreResult<Option<DiscountPart>> {
        Ok(self.lock().discounts.remove(&id))
    }

    async fn access_changes(&self, resource_id: i64) -> StoreResult<Vec<AccessChange>> {
        Ok(self
            .lock()
            .access_changes
            .values()
            .filter(|c| c.resource_id == resource_id)
            .cloned()
            .collect())
    }

    async fn access_change(&self, id: i64) -> StoreResult<Option<AccessChange>> {
        Ok(self.lock().access_changes.get(&id).cloned())
    }

    async fn create_access_change(
        &self,
        resource_id: i64,
        req: &AccessChangeReq,
    ) -> StoreResult<AccessChange> {
        let mut s = self.lock();
        let change = AccessChange {
            id: s.id(),
            resource_id,
            description: req.description.clone(),
            extend_deadline: req.extend_deadline,
            max_attempts: req.max_attempts,
            usernames: req.usernames.clone(),
            emails: req.emails.clone(),
        };
        s.access_changes.insert(change.id, change.clone());
        Ok(change)
    }

    async fn update_access_change(
        &self,
        id: i64,
        req: &AccessChangeReq,
    ) -> StoreResult<Option<AccessChange>> {
        Ok(self.lock().access_changes.get_mut(&id).map(|c| {
            c.description = req.description.clone();
            c.extend_deadline = req.extend_deadline;
            c.max_attempts = req.max_attempts;
            c.usernames = req.usernames.clone();
            c.emails = req.emails.clone();
            c.clone()
        }))
    }

    async fn delete_access_change(&self, id: i64) -> StoreResult<bool> {
        Ok(self.lock().access_changes.remove(&id).is_some())
    }

    async fn editor_links(&self) -> StoreResult<Vec<EditorLink>> {
        let mut links: Vec<EditorLink> = self.lock().editor_links.values().cloned().collect();
        links.sort_by(|a, b| (&a.name, a.id).cmp(&(&b.name, b.id)));
        Ok(links)
    }

    async fn editor_link(&self, id: i64) -> StoreResult<Option<EditorLink>> {
        Ok(self.lock().editor_links.get(&id).cloned())
    }

    async fn save_editor_link_cache(
        &self,
        id: i64,
        available_exams: serde_json::Value,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(link) = self.lock().editor_links.get_mut(&id) {
            link.cached_available_exams = available_exams;
            link.last_cache_update = Some(at);
        }
        Ok(())
    }
}
