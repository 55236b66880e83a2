use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_with::{formats::CommaSeparator, serde_as, StringWithSeparator};
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use uuid::Uuid;

use crate::{
    auth::Instructor,
    dispatch,
    error::{AppError, AppResult, OrNotFound},
    exam_package, export,
    models::*,
    outcome::grade_user,
    receipt::{ReceiptError, ReceiptSigner},
    remark,
    store::Store,
    tasks::{Task, TaskQueue},
};

const ATTEMPTS_PER_PAGE: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub signer: ReceiptSigner,
    pub data_dir: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // dashboards
        .route("/resources/:id/dashboard", get(dashboard))
        .route("/resources/:id/student-progress", get(student_progress))
        .route("/resources/:id/stats", get(stats))
        .route("/resources/:id/attempts", get(all_attempts))
        // exports
        .route("/resources/:id/scores.csv", get(scores_csv))
        .route("/resources/:id/attempts.csv", get(attempts_csv))
        .route("/resources/:id/dump.json", get(json_dump))
        // reporting
        .route("/resources/:id/report-scores", post(report_all_scores))
        .route("/report-processes/:id/dismiss", post(dismiss_report_process))
        // access
        .route(
            "/resources/:id/access-tokens/:user_id",
            post(grant_access_token).delete(remove_access_token),
        )
        .route(
            "/resources/:id/access-changes",
            get(list_access_changes).post(create_access_change),
        )
        .route(
            "/access-changes/:id",
            get(get_access_change)
                .put(update_access_change)
                .delete(delete_access_change),
        )
        // discounted parts
        .route("/resources/:id/discounts", get(list_discounts).post(discount_part))
        .route("/discounts/:id", put(update_discount).delete(delete_discount))
        // exam versions
        .route("/resources/:id/exams", get(list_exams).post(upload_exam))
        .route("/resources/:id/exams/:exam_id/restore", post(restore_exam))
        .route("/editor-links/:id/refresh", post(refresh_editor_link))
        // remarking
        .route("/resources/:id/remark", get(remark_context))
        .route("/resources/:id/remark/attempt-data", get(remark_attempt_data))
        .route("/resources/:id/remark/save", post(remark_save))
        // receipts
        .route("/attempts/:id/receipt", get(issue_receipt))
        .route("/resources/:id/validate-receipt", post(validate_receipt))
        .with_state(state)
}

async fn load_resource(store: &dyn Store, id: i64) -> AppResult<Resource> {
    store.resource(id).await?.or_not_found("resource")
}

// --- dashboards ---

async fn dashboard(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let attempts = st.store.attempts_for_resource(id).await?;
    let students = st.store.students(id).await?;
    let processes = st.store.report_processes(id).await?;
    let view = dispatch::current_report_process(&processes);

    Ok(Json(serde_json::json!({
        "resource": resource,
        "instructors": st.store.instructors(id).await?,
        "num_unbroken_attempts": attempts.iter().filter(|a| !a.broken).count(),
        "num_students": students.len(),
        "students": students,
        "last_report_process": view.last_report_process,
        "dismissed_report_process": view.dismissed_report_process,
    })))
}

async fn student_progress(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let attempts = st.store.attempts_for_resource(id).await?;

    let mut summary = Vec::new();
    for student in st.store.students(id).await? {
        let theirs: Vec<Attempt> = attempts
            .iter()
            .filter(|a| a.user_id == student.id)
            .cloned()
            .collect();
        summary.push(serde_json::json!({
            "student": student,
            "grade": grade_user(&theirs, resource.grading_method),
            "user_data": st.store.user_data(id, student.id).await?,
            "num_attempts": theirs.iter().filter(|a| !a.broken).count(),
            "num_access_tokens": st.store.access_token_count(id, student.id).await?,
        }));
    }

    Ok(Json(serde_json::json!({
        "resource": resource,
        "unlimited_attempts": resource.max_attempts == 0,
        "student_summary": summary,
    })))
}

async fn stats(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    load_resource(st.store.as_ref(), id).await?;
    let mut counts: HashMap<CompletionStatus, usize> = HashMap::new();
    for a in st.store.attempts_for_resource(id).await? {
        *counts.entry(a.completion_status).or_default() += 1;
    }
    let completion_counts: Vec<_> = CompletionStatus::ALL
        .iter()
        .map(|s| (s.label(), s.as_str(), counts.get(s).copied().unwrap_or(0)))
        .collect();
    Ok(Json(serde_json::json!({ "completion_counts": completion_counts })))
}

#[derive(Deserialize, Debug, Default)]
struct AttemptsQuery {
    userid: Option<String>,
    query: Option<String>,
    page: Option<usize>,
}

async fn all_attempts(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    Query(q): Query<AttemptsQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let mut attempts = st.store.attempts_for_resource(id).await?;
    let mut users: HashMap<i64, User> = HashMap::new();
    for a in &attempts {
        if !users.contains_key(&a.user_id) {
            if let Some(u) = st.store.user(a.user_id).await? {
                users.insert(u.id, u);
            }
        }
    }

    let mut shown_query = String::new();
    if let Some(userid) = q.userid.as_deref().filter(|s| !s.is_empty()) {
        // an unknown or malformed user id shows everything, never a name search
        let user = match userid.parse::<i64>() {
            Ok(uid) => st.store.user(uid).await?,
            Err(_) => None,
        };
        if let Some(user) = user {
            shown_query = user.full_name();
            attempts.retain(|a| a.user_id == user.id);
        }
    } else if let Some(query) = q.query.as_deref() {
        shown_query = query.to_string();
        for word in query.split_whitespace().map(str::to_lowercase) {
            attempts.retain(|a| {
                users.get(&a.user_id).is_some_and(|u| {
                    u.first_name.to_lowercase().contains(&word)
                        || u.last_name.to_lowercase().contains(&word)
                })
            });
        }
    }

    let total = attempts.len();
    let num_pages = total.div_ceil(ATTEMPTS_PER_PAGE).max(1);
    let page = q.page.unwrap_or(1).clamp(1, num_pages);
    let rows: Vec<_> = attempts
        .iter()
        .skip((page - 1) * ATTEMPTS_PER_PAGE)
        .take(ATTEMPTS_PER_PAGE)
        .map(|a| serde_json::json!({ "attempt": a, "user": users.get(&a.user_id) }))
        .collect();

    Ok(Json(serde_json::json!({
        "resource": resource,
        "query": shown_query,
        "page": page,
        "num_pages": num_pages,
        "total": total,
        "attempts": rows,
    })))
}

// --- exports ---

fn attachment(content_type: &'static str, filename: &str, body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

async fn scores_csv(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let rows = export::scores_rows(st.store.as_ref(), &resource).await?;
    Ok(attachment(
        "text/csv",
        &format!("{}-scores.csv", resource.slug),
        Body::from(export::to_csv(&rows)),
    ))
}

async fn attempts_csv(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let rows = export::attempts_rows(st.store.as_ref(), &resource).await?;
    Ok(attachment(
        "text/csv",
        &format!("{}-attempts.csv", resource.slug),
        Body::from(export::to_csv(&rows)),
    ))
}

#[derive(Deserialize, Debug, Default)]
struct DumpQuery {
    full: Option<String>,
}

async fn json_dump(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    Query(q): Query<DumpQuery>,
) -> AppResult<Response> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let attempts = st.store.attempts_for_resource(id).await?;
    let filename = export::json_dump_filename(&resource);
    let stream = export::json_dump_stream(st.store.clone(), resource, attempts, q.full.is_some());
    Ok(attachment("application/json", &filename, Body::from_stream(stream)))
}

// --- reporting ---

async fn report_all_scores(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<impl IntoResponse> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    st.queue.submit(Task::ReportResourceScores {
        resource_id: resource.id,
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "resource": resource, "queued": true })),
    ))
}

async fn dismiss_report_process(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<ReportProcess>> {
    let process = st
        .store
        .dismiss_report_process(id)
        .await?
        .or_not_found("report process")?;
    Ok(Json(process))
}

// --- access ---

async fn grant_access_token(
    State(st): State<AppState>,
    _who: Instructor,
    Path((id, user_id)): Path<(i64, i64)>,
) -> AppResult<impl IntoResponse> {
    load_resource(st.store.as_ref(), id).await?;
    st.store.user(user_id).await?.or_not_found("user")?;
    let token = st.store.grant_access_token(id, user_id).await?;
    Ok((StatusCode::CREATED, Json(token)))
}

async fn remove_access_token(
    State(st): State<AppState>,
    _who: Instructor,
    Path((id, user_id)): Path<(i64, i64)>,
) -> AppResult<StatusCode> {
    if st.store.revoke_access_token(id, user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("access token"))
    }
}

fn validate_access_change(req: &AccessChangeReq) -> AppResult<()> {
    if req.extend_deadline.is_none() && req.max_attempts.is_none() {
        return Err(AppError::bad_request(
            "an access change must extend the deadline or change the number of attempts",
        ));
    }
    if req.max_attempts.is_some_and(|n| n < 0) {
        return Err(AppError::bad_request("max_attempts cannot be negative"));
    }
    if req.usernames.is_empty() && req.emails.is_empty() {
        return Err(AppError::bad_request("name at least one student"));
    }
    Ok(())
}

async fn list_access_changes(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<AccessChange>>> {
    load_resource(st.store.as_ref(), id).await?;
    Ok(Json(st.store.access_changes(id).await?))
}

async fn create_access_change(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    Json(req): Json<AccessChangeReq>,
) -> AppResult<impl IntoResponse> {
    load_resource(st.store.as_ref(), id).await?;
    validate_access_change(&req)?;
    let change = st.store.create_access_change(id, &req).await?;
    Ok((StatusCode::CREATED, Json(change)))
}

async fn get_access_change(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<AccessChange>> {
    Ok(Json(st.store.access_change(id).await?.or_not_found("access change")?))
}

async fn update_access_change(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    Json(req): Json<AccessChangeReq>,
) -> AppResult<Json<AccessChange>> {
    validate_access_change(&req)?;
    let change = st
        .store
        .update_access_change(id, &req)
        .await?
        .or_not_found("access change")?;
    Ok(Json(change))
}

async fn delete_access_change(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    if st.store.delete_access_change(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("access change"))
    }
}

// --- discounted parts ---

async fn list_discounts(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<Vec<DiscountPart>>> {
    load_resource(st.store.as_ref(), id).await?;
    Ok(Json(st.store.discount_parts(id).await?))
}

#[derive(Deserialize, Debug)]
struct DiscountReq {
    part: String,
}

async fn discount_part(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    Json(req): Json<DiscountReq>,
) -> AppResult<Json<serde_json::Value>> {
    load_resource(st.store.as_ref(), id).await?;
    if req.part.trim().is_empty() {
        return Err(AppError::bad_request("part is required"));
    }
    let (discount, created) = st.store.get_or_create_discount(id, &req.part).await?;
    Ok(Json(serde_json::json!({
        "pk": discount.id,
        "created": created,
        "behaviour": discount.behaviour,
        "part": discount.part,
    })))
}

#[derive(Deserialize, Debug)]
struct DiscountBehaviourReq {
    behaviour: DiscountBehaviour,
}

async fn update_discount(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    Json(req): Json<DiscountBehaviourReq>,
) -> AppResult<Json<DiscountPart>> {
    let discount = st
        .store
        .update_discount(id, req.behaviour)
        .await?
        .or_not_found("discount")?;
    Ok(Json(discount))
}

async fn delete_discount(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let discount = st.store.delete_discount(id).await?.or_not_found("discount")?;
    Ok(Json(serde_json::json!({
        "resource": discount.resource_id,
        "part": discount.part,
        "discounted": false,
    })))
}

// --- exam versions ---

async fn list_exams(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let editor_links = st.store.editor_links().await?;
    let available: Vec<serde_json::Value> =
        editor_links.iter().flat_map(|l| l.available_exams()).collect();
    Ok(Json(serde_json::json!({
        "current_exam": resource.exam_id,
        "exams": st.store.exams_for_resource(id).await?,
        "editor_links": editor_links,
        "available_exams": available,
    })))
}

async fn upload_exam(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    mut mp: Multipart,
) -> AppResult<impl IntoResponse> {
    let resource = load_resource(st.store.as_ref(), id).await?;

    let mut title = None;
    let mut zip_bytes: Option<Vec<u8>> = None;
    let mut safe_replacement = false;
    while let Some(field) = mp
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "title" => {
                title = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::bad_request(e.to_string()))?,
                )
            }
            "file" => {
                zip_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::bad_request(e.to_string()))?
                        .to_vec(),
                )
            }
            "safe_replacement" => {
                let v = field.text().await.map_err(|e| AppError::bad_request(e.to_string()))?;
                safe_replacement = matches!(v.as_str(), "true" | "on" | "1");
            }
            _ => {}
        }
    }
    let bytes = zip_bytes.ok_or_else(|| AppError::bad_request("file is required"))?;

    let rel_dir = format!("exams/{}", Uuid::new_v4());
    let out_dir = st.data_dir.join(&rel_dir);
    let (manifest_path, manifest) = exam_package::unpack(&bytes, &out_dir)?;
    let package_dir = manifest_path
        .parent()
        .and_then(|p| p.strip_prefix(&st.data_dir).ok())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(rel_dir);

    let exam = st
        .store
        .create_exam(NewExam {
            title: title
                .filter(|t| !t.trim().is_empty())
                .or(manifest.title)
                .unwrap_or_else(|| "Untitled exam".into()),
            resource_id: resource.id,
            launch_href: manifest.launch_href,
            base_path: package_dir,
        })
        .await?;

    // the new version only goes live once the old attempts have moved over
    let mut moved = 0;
    if let (true, Some(old)) = (safe_replacement, resource.exam_id) {
        moved = st.store.reassign_attempts_exam(resource.id, old, exam.id).await?;
    }
    st.store.set_live_exam(resource.id, exam.id).await?;
    tracing::info!(resource = resource.id, exam = exam.id, moved, "exam package updated");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "exam": exam, "reassigned_attempts": moved })),
    ))
}

async fn restore_exam(
    State(st): State<AppState>,
    _who: Instructor,
    Path((id, exam_id)): Path<(i64, i64)>,
) -> AppResult<Json<Exam>> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let exam = st
        .store
        .exam(exam_id)
        .await?
        .filter(|e| e.resource_id == Some(resource.id))
        .or_not_found("exam")?;
    st.store.set_live_exam(resource.id, exam.id).await?;
    Ok(Json(exam))
}

async fn refresh_editor_link(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    st.store.editor_link(id).await?.or_not_found("editor link")?;
    st.queue.submit(Task::UpdateEditorLinkCache { editor_link_id: id });
    Ok(StatusCode::ACCEPTED)
}

// --- remarking ---

async fn remark_context(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let exam = match resource.exam_id {
        Some(exam_id) => st.store.exam(exam_id).await?,
        None => None,
    }
    .or_not_found("exam")?;

    let mut attempts = Vec::new();
    for a in st.store.attempts_for_resource(id).await?.iter().filter(|a| !a.broken) {
        let user = st.store.user(a.user_id).await?;
        let data = st.store.user_data(id, a.user_id).await?;
        attempts.push(serde_json::json!({
            "pk": a.id,
            "completion_status": a.completion_status,
            "user": {
                "full_name": user.as_ref().map(User::full_name),
                "identifier": user.as_ref().map(|u| {
                    data.as_ref().map_or(u.username.as_str(), |d| d.source_id(u)).to_string()
                }),
            },
        }));
    }

    Ok(Json(serde_json::json!({
        "resource": resource,
        "attempts": attempts,
        "parameters": { "save_url": format!("/resources/{id}/remark/save") },
        "exam_source": exam_package::read_exam_source(&st.data_dir.join(&exam.base_path)),
    })))
}

#[serde_as]
#[derive(Deserialize, Debug, Default)]
struct AttemptPksQuery {
    #[serde_as(as = "StringWithSeparator::<CommaSeparator, i64>")]
    #[serde(default)]
    attempt_pks: Vec<i64>,
}

async fn remark_attempt_data(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    Query(q): Query<AttemptPksQuery>,
) -> AppResult<Json<serde_json::Value>> {
    load_resource(st.store.as_ref(), id).await?;
    let cmis = remark::attempt_cmis(st.store.as_ref(), id, &q.attempt_pks, Utc::now()).await?;
    Ok(Json(serde_json::json!({ "cmis": cmis })))
}

async fn remark_save(
    State(st): State<AppState>,
    who: Instructor,
    Path(id): Path<i64>,
    body: String,
) -> AppResult<Response> {
    load_resource(st.store.as_ref(), id).await?;
    let req: RemarkSaveReq = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            let saved: Vec<i64> = Vec::new();
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "message": e.to_string(), "saved": saved })),
            )
                .into_response());
        }
    };
    let outcome = remark::save_changed_data(st.store.as_ref(), id, who.user_id, &req, Utc::now()).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(outcome)).into_response())
}

// --- receipts ---

async fn issue_receipt(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let attempt = st.store.attempt(id).await?.or_not_found("attempt")?;
    let resource = load_resource(st.store.as_ref(), attempt.resource_id).await?;
    Ok(Json(serde_json::json!({
        "attempt": attempt.id,
        "code": st.signer.issue(&attempt, &resource),
    })))
}

#[derive(Deserialize, Debug)]
struct ValidateReceiptReq {
    code: String,
}

async fn validate_receipt(
    State(st): State<AppState>,
    _who: Instructor,
    Path(id): Path<i64>,
    Json(req): Json<ValidateReceiptReq>,
) -> AppResult<Json<serde_json::Value>> {
    let resource = load_resource(st.store.as_ref(), id).await?;
    let body = match st.signer.verify(st.store.as_ref(), &req.code, &resource).await {
        Ok(v) => serde_json::json!({
            "submitted": true,
            "valid": true,
            "summary": v.summary,
            "attempt": v.attempt,
        }),
        Err(ReceiptError::InvalidSignature) => serde_json::json!({
            "submitted": true,
            "valid": false,
            "invalid": true,
            "message": "This receipt is not valid.",
        }),
        Err(ReceiptError::AttemptNotFound { summary, .. }) => serde_json::json!({
            "submitted": true,
            "valid": false,
            "no_attempt": true,
            "summary": summary,
            "message": "There is no matching attempt.",
        }),
        Err(ReceiptError::Store(e)) => return Err(e.into()),
    };
    Ok(Json(body))
}
