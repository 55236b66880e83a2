use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar};
use std::collections::BTreeMap;

use super::{Store, StoreResult};
use crate::{db::Db, models::*};

const RESOURCE_COLS: &str =
    "id, title, slug, context_name, exam_id, grading_method, max_attempts";
const EXAM_COLS: &str = "id, title, resource_id, launch_href, base_path, created_at";
const USER_COLS: &str = "u.id, u.username, u.first_name, u.last_name, u.email";
const ATTEMPT_COLS: &str = "id, resource_id, user_id, exam_id, start_time, end_time, \
     completion_status, scaled_score, raw_score, max_score, question_scores, diffed, broken";
const REPORT_COLS: &str = "id, resource_id, status, response, dismissed, started_at";
const ACCESS_CHANGE_COLS: &str =
    "id, resource_id, description, extend_deadline, max_attempts, usernames, emails";
const EDITOR_LINK_COLS: &str = "id, name, url, cached_available_exams, last_cache_update";

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn resource(&self, id: i64) -> StoreResult<Option<Resource>> {
        let sql = format!("SELECT {RESOURCE_COLS} FROM resources WHERE id = $1");
        Ok(query_as::<_, Resource>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn exam(&self, id: i64) -> StoreResult<Option<Exam>> {
        let sql = format!("SELECT {EXAM_COLS} FROM exams WHERE id = $1");
        Ok(query_as::<_, Exam>(&sql).bind(id).fetch_optional(&self.db).await?)
    }

    async fn exams_for_resource(&self, resource_id: i64) -> StoreResult<Vec<Exam>> {
        let sql = format!(
            "SELECT {EXAM_COLS} FROM exams WHERE resource_id = $1 ORDER BY created_at DESC, id DESC"
        );
        Ok(query_as::<_, Exam>(&sql)
            .bind(resource_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn create_exam(&self, exam: NewExam) -> StoreResult<Exam> {
        let sql = format!(
            "INSERT INTO exams (title, resource_id, launch_href, base_path) \
             VALUES ($1, $2, $3, $4) RETURNING {EXAM_COLS}"
        );
        Ok(query_as::<_, Exam>(&sql)
            .bind(&exam.title)
            .bind(exam.resource_id)
            .bind(&exam.launch_href)
            .bind(&exam.base_path)
            .fetch_one(&self.db)
            .await?)
    }

    async fn set_live_exam(&self, resource_id: i64, exam_id: i64) -> StoreResult<()> {
        query("UPDATE resources SET exam_id = $2 WHERE id = $1")
            .bind(resource_id)
            .bind(exam_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn reassign_attempts_exam(&self, resource_id: i64, from: i64, to: i64) -> StoreResult<u64> {
        let mut tx = self.db.begin().await?;
        let done = query("UPDATE attempts SET exam_id = $3 WHERE resource_id = $1 AND exam_id = $2")
            .bind(resource_id)
            .bind(from)
            .bind(to)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }

    async fn user(&self, id: i64) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLS} FROM users u WHERE u.id = $1");
        Ok(query_as::<_, User>(&sql).bind(id).fetch_optional(&self.db).await?)
    }

    async fn students(&self, resource_id: i64) -> StoreResult<Vec<User>> {
        let sql = format!(
            "SELECT DISTINCT {USER_COLS} FROM users u \
             JOIN attempts a ON a.user_id = u.id WHERE a.resource_id = $1 ORDER BY u.id"
        );
        Ok(query_as::<_, User>(&sql)
            .bind(resource_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn instructors(&self, resource_id: i64) -> StoreResult<Vec<User>> {
        let sql = format!(
            "SELECT DISTINCT {USER_COLS} FROM users u \
             JOIN lti_user_data d ON d.user_id = u.id \
             WHERE d.resource_id = $1 AND d.is_instructor ORDER BY u.id"
        );
        Ok(query_as::<_, User>(&sql)
            .bind(resource_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn user_data(&self, resource_id: i64, user_id: i64) -> StoreResult<Option<LtiUserData>> {
        Ok(query_as::<_, LtiUserData>(
            "SELECT user_id, resource_id, consumer_key, lis_result_sourcedid, \
             lis_outcome_service_url, lis_person_sourcedid, is_instructor \
             FROM lti_user_data WHERE resource_id = $1 AND user_id = $2",
        )
        .bind(resource_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn consumer_secret(&self, consumer_key: &str) -> StoreResult<Option<String>> {
        Ok(query_scalar::<_, String>("SELECT secret FROM lti_consumers WHERE key = $1")
            .bind(consumer_key)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn attempt(&self, id: i64) -> StoreResult<Option<Attempt>> {
        let sql = format!("SELECT {ATTEMPT_COLS} FROM attempts WHERE id = $1");
        Ok(query_as::<_, Attempt>(&sql).bind(id).fetch_optional(&self.db).await?)
    }

    async fn attempts_for_resource(&self, resource_id: i64) -> StoreResult<Vec<Attempt>> {
        let sql = format!(
            "SELECT {ATTEMPT_COLS} FROM attempts WHERE resource_id = $1 ORDER BY start_time, id"
        );
        Ok(query_as::<_, Attempt>(&sql)
            .bind(resource_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn undiffed_attempts(&self) -> StoreResult<Vec<Attempt>> {
        let sql = format!("SELECT {ATTEMPT_COLS} FROM attempts WHERE NOT diffed ORDER BY start_time, id");
        Ok(query_as::<_, Attempt>(&sql).fetch_all(&self.db).await?)
    }

    async fn scorm_elements(&self, attempt_id: i64) -> StoreResult<Vec<ScormElement>> {
        Ok(query_as::<_, ScormElement>(
            "SELECT id, attempt_id, key, value, time, counter FROM scorm_elements \
             WHERE attempt_id = $1 ORDER BY time, counter, id",
        )
        .bind(attempt_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn scorm_element_diffs(&self, attempt_id: i64) -> StoreResult<Vec<ScormElementDiff>> {
        Ok(query_as::<_, ScormElementDiff>(
            "SELECT d.element_id, d.diff_against_id, d.patch FROM scorm_element_diffs d \
             JOIN scorm_elements e ON e.id = d.element_id WHERE e.attempt_id = $1",
        )
        .bind(attempt_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn mark_diffed(&self, attempt_id: i64, diffs: &[ScormElementDiff]) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let claimed = query("UPDATE attempts SET diffed = TRUE WHERE id = $1 AND NOT diffed")
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        for d in diffs {
            query(
                "INSERT INTO scorm_element_diffs (element_id, diff_against_id, patch) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (element_id) DO UPDATE \
                 SET diff_against_id = EXCLUDED.diff_against_id, patch = EXCLUDED.patch",
            )
            .bind(d.element_id)
            .bind(d.diff_against_id)
            .bind(&d.patch)
            .execute(&mut *tx)
            .await?;
            query("UPDATE scorm_elements SET value = '' WHERE id = $1")
                .bind(d.element_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn save_remarked_elements(
        &self,
        attempt_id: i64,
        remarked_by: i64,
        changed: &BTreeMap<String, String>,
        time: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let exists = query_scalar::<_, i64>("SELECT id FROM attempts WHERE id = $1 FOR UPDATE")
            .bind(attempt_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(false);
        }
        for (key, value) in changed {
            let element_id = query_scalar::<_, i64>(
                "INSERT INTO scorm_elements (attempt_id, key, value, time, counter) \
                 VALUES ($1, $2, $3, $4, 0) RETURNING id",
            )
            .bind(attempt_id)
            .bind(key)
            .bind(value)
            .bind(time)
            .fetch_one(&mut *tx)
            .await?;
            query("INSERT INTO remarked_scorm_elements (element_id, user_id) VALUES ($1, $2)")
                .bind(element_id)
                .bind(remarked_by)
                .execute(&mut *tx)
                .await?;
        }
        query("UPDATE attempts SET diffed = FALSE WHERE id = $1")
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn create_report_process(&self, resource_id: i64) -> StoreResult<ReportProcess> {
        let sql = format!(
            "INSERT INTO report_processes (resource_id, status) VALUES ($1, 'reporting') \
             RETURNING {REPORT_COLS}"
        );
        Ok(query_as::<_, ReportProcess>(&sql)
            .bind(resource_id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn finish_report_process(
        &self,
        id: i64,
        status: ReportProcessStatus,
        response: Option<String>,
    ) -> StoreResult<()> {
        query("UPDATE report_processes SET status = $2, response = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(response)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn report_processes(&self, resource_id: i64) -> StoreResult<Vec<ReportProcess>> {
        let sql = format!(
            "SELECT {REPORT_COLS} FROM report_processes WHERE resource_id = $1 \
             ORDER BY started_at DESC, id DESC"
        );
        Ok(query_as::<_, ReportProcess>(&sql)
            .bind(resource_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn dismiss_report_process(&self, id: i64) -> StoreResult<Option<ReportProcess>> {
        let sql = format!(
            "UPDATE report_processes SET dismissed = TRUE WHERE id = $1 RETURNING {REPORT_COLS}"
        );
        Ok(query_as::<_, ReportProcess>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn grant_access_token(&self, resource_id: i64, user_id: i64) -> StoreResult<AccessToken> {
        Ok(query_as::<_, AccessToken>(
            "INSERT INTO access_tokens (resource_id, user_id) VALUES ($1, $2) \
             RETURNING id, resource_id, user_id, created_at",
        )
        .bind(resource_id)
        .bind(user_id)
        .fetch_one(&self.db)
        .await?)
    }

    async fn revoke_access_token(&self, resource_id: i64, user_id: i64) -> StoreResult<bool> {
        let done = query(
            "DELETE FROM access_tokens WHERE id = (\
             SELECT id FROM access_tokens WHERE resource_id = $1 AND user_id = $2 \
             ORDER BY id LIMIT 1)",
        )
        .bind(resource_id)
        .bind(user_id)
        .execute(&self.db)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn access_token_count(&self, resource_id: i64, user_id: i64) -> StoreResult<i64> {
        Ok(query_scalar::<_, i64>(
            "SELECT count(*) FROM access_tokens WHERE resource_id = $1 AND user_id = $2",
        )
        .bind(resource_id)
        .bind(user_id)
        .fetch_one(&self.db)
        .await?)
    }

    async fn discount_parts(&self, resource_id: i64) -> StoreResult<Vec<DiscountPart>> {
        Ok(query_as::<_, DiscountPart>(
            "SELECT id, resource_id, part, behaviour FROM discount_parts \
             WHERE resource_id = $1 ORDER BY part",
        )
        .bind(resource_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn get_or_create_discount(
        &self,
        resource_id: i64,
        part: &str,
    ) -> StoreResult<(DiscountPart, bool)> {
        let created = query_as::<_, DiscountPart>(
            "INSERT INTO discount_parts (resource_id, part) VALUES ($1, $2) \
             ON CONFLICT (resource_id, part) DO NOTHING \
             RETURNING id, resource_id, part, behaviour",
        )
        .bind(resource_id)
        .bind(part)
        .fetch_optional(&self.db)
        .await?;
        if let Some(d) = created {
            return Ok((d, true));
        }
        let existing = query_as::<_, DiscountPart>(
            "SELECT id, resource_id, part, behaviour FROM discount_parts \
             WHERE resource_id = $1 AND part = $2",
        )
        .bind(resource_id)
        .bind(part)
        .fetch_one(&self.db)
        .await?;
        Ok((existing, false))
    }

    async fn update_discount(
        &self,
        id: i64,
        behaviour: DiscountBehaviour,
    ) -> StoreResult<Option<DiscountPart>> {
        Ok(query_as::<_, DiscountPart>(
            "UPDATE discount_parts SET behaviour = $2 WHERE id = $1 \
             RETURNING id, resource_id, part, behaviour",
        )
        .bind(id)
        .bind(behaviour.as_str())
        .fetch_optional(&self.db)
        .await?)
    }

    async fn delete_discount(&self, id: i64) -> StoreResult<Option<DiscountPart>> {
        Ok(query_as::<_, DiscountPart>(
            "DELETE FROM discount_parts WHERE id = $1 RETURNING id, resource_id, part, behaviour",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?)
    }

    async fn access_changes(&self, resource_id: i64) -> StoreResult<Vec<AccessChange>> {
        let sql = format!(
            "SELECT {ACCESS_CHANGE_COLS} FROM access_changes WHERE resource_id = $1 ORDER BY id"
        );
        Ok(query_as::<_, AccessChange>(&sql)
            .bind(resource_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn access_change(&self, id: i64) -> StoreResult<Option<AccessChange>> {
        let sql = format!("SELECT {ACCESS_CHANGE_COLS} FROM access_changes WHERE id = $1");
        Ok(query_as::<_, AccessChange>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn create_access_change(
        &self,
        resource_id: i64,
        req: &AccessChangeReq,
    ) -> StoreResult<AccessChange> {
        let sql = format!(
            "INSERT INTO access_changes \
             (resource_id, description, extend_deadline, max_attempts, usernames, emails) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {ACCESS_CHANGE_COLS}"
        );
        Ok(query_as::<_, AccessChange>(&sql)
            .bind(resource_id)
            .bind(&req.description)
            .bind(req.extend_deadline)
            .bind(req.max_attempts)
            .bind(&req.usernames)
            .bind(&req.emails)
            .fetch_one(&self.db)
            .await?)
    }

    async fn update_access_change(
        &self,
        id: i64,
        req: &AccessChangeReq,
    ) -> StoreResult<Option<AccessChange>> {
        let sql = format!(
            "UPDATE access_changes SET description = $2, extend_deadline = $3, \
             max_attempts = $4, usernames = $5, emails = $6 WHERE id = $1 \
             RETURNING {ACCESS_CHANGE_COLS}"
        );
        Ok(query_as::<_, AccessChange>(&sql)
            .bind(id)
            .bind(&req.description)
            .bind(req.extend_deadline)
            .bind(req.max_attempts)
            .bind(&req.usernames)
            .bind(&req.emails)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn delete_access_change(&self, id: i64) -> StoreResult<bool> {
        let done = query("DELETE FROM access_changes WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn editor_links(&self) -> StoreResult<Vec<EditorLink>> {
        let sql = format!("SELECT {EDITOR_LINK_COLS} FROM editor_links ORDER BY name, id");
        Ok(query_as::<_, EditorLink>(&sql).fetch_all(&self.db).await?)
    }

    async fn editor_link(&self, id: i64) -> StoreResult<Option<EditorLink>> {
        let sql = format!("SELECT {EDITOR_LINK_COLS} FROM editor_links WHERE id = $1");
        Ok(query_as::<_, EditorLink>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn save_editor_link_cache(
        &self,
        id: i64,
        available_exams: serde_json::Value,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        query("UPDATE editor_links SET cached_available_exams = $2, last_cache_update = $3 WHERE id = $1")
            .bind(id)
            .bind(available_exams)
            .bind(at)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
