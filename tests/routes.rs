mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use lti_exam_runtime::models::RemarkSaveReq;
use lti_exam_runtime::receipt::ReceiptSigner;
use lti_exam_runtime::routes::{router, AppState};
use lti_exam_runtime::store::{MemoryStore, Store};
use lti_exam_runtime::tasks::{RecordingQueue, Task};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use common::{attempt, minutes};

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<RecordingQueue>,
    app: Router,
    data: tempfile::TempDir,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let r = store.add_resource("Week 3 quiz", "week-3-quiz", "MAS1001");
    let amy = store.add_user("amy", "Amy", "Pond");
    let a = store.add_attempt(attempt(r.id, amy.id, minutes(0), 0.6, 10.0));
    store.add_element(a.id, "cmi.suspend_data", "{\"q0\":1}", minutes(5));
    store.add_attempt(attempt(r.id, amy.id, minutes(40), 0.9, 10.0));
    let queue = Arc::new(RecordingQueue::new());
    let data = tempfile::tempdir().unwrap();
    let app = router(AppState {
        store: store.clone(),
        queue: queue.clone(),
        signer: ReceiptSigner::new("test secret"),
        data_dir: data.path().to_path_buf(),
    });
    Harness {
        store,
        queue,
        app,
        data,
    }
}

fn instructor(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-lti-roles", "urn:lti:role:ims/lis/Instructor")
        .header("x-lti-user-id", "99")
}

fn json_body(method: &str, uri: &str, body: &Value) -> Request<Body> {
    instructor(method, uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes.to_vec())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, _, bytes) = send(app, req).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn students_are_turned_away() {
    let h = harness();
    let req = Request::builder()
        .uri("/resources/1/dashboard")
        .header("x-lti-roles", "Learner")
        .header("x-lti-user-id", "2")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&h.app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "instructor role required");
}

#[tokio::test]
async fn dashboard_counts_attempts() {
    let h = harness();
    let (status, body) =
        send_json(&h.app, instructor("GET", "/resources/1/dashboard").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["num_unbroken_attempts"], 2);
    assert_eq!(body["num_students"], 1);
    assert!(body["last_report_process"].is_null());

    let (status, _) =
        send_json(&h.app, instructor("GET", "/resources/404/dashboard").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn report_scores_is_queued() {
    let h = harness();
    let (status, _) =
        send_json(&h.app, instructor("POST", "/resources/1/report-scores").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(h.queue.submitted(), vec![Task::ReportResourceScores { resource_id: 1 }]);
}

#[tokio::test]
async fn scores_csv_is_an_attachment() {
    let h = harness();
    let (status, headers, body) =
        send(&h.app, instructor("GET", "/resources/1/scores.csv").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"week-3-quiz-scores.csv\""
    );
    let text = String::from_utf8(body).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("Amy,Pond,amy@example.com,amy,90,9,10"));
}

#[tokio::test]
async fn receipts_verify_against_their_resource() {
    let h = harness();
    let (_, issued) =
        send_json(&h.app, instructor("GET", "/attempts/3/receipt").body(Body::empty()).unwrap()).await;
    let code = issued["code"].as_str().unwrap().to_string();

    let (status, body) = send_json(
        &h.app,
        json_body("POST", "/resources/1/validate-receipt", &json!({ "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["summary"]["pk"], 3);

    let (_, body) = send_json(
        &h.app,
        json_body("POST", "/resources/1/validate-receipt", &json!({ "code": format!("{code}x") })),
    )
    .await;
    assert_eq!(body["invalid"], true);

    h.store.remove_attempt(3);
    let (_, body) = send_json(
        &h.app,
        json_body("POST", "/resources/1/validate-receipt", &json!({ "code": code })),
    )
    .await;
    assert_eq!(body["no_attempt"], true);
    assert_eq!(body["summary"]["pk"], 3);
}

#[tokio::test]
async fn access_tokens_can_be_granted_and_revoked() {
    let h = harness();
    let uri = "/resources/1/access-tokens/2";
    let (status, _) = send_json(&h.app, instructor("POST", uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(h.store.access_token_total(), 1);

    let (status, _) = send_json(&h.app, instructor("DELETE", uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send_json(&h.app, instructor("DELETE", uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(h.store.access_token_total(), 0);
}

#[tokio::test]
async fn discounting_a_part_twice_reuses_it() {
    let h = harness();
    let req = || json_body("POST", "/resources/1/discounts", &json!({ "part": "q0p1" }));
    let (_, first) = send_json(&h.app, req()).await;
    let (_, second) = send_json(&h.app, req()).await;
    assert_eq!(first["created"], true);
    assert_eq!(second["created"], false);
    assert_eq!(first["pk"], second["pk"]);
    assert_eq!(first["behaviour"], "remove");

    let uri = format!("/discounts/{}", first["pk"]);
    let (_, updated) = send_json(&h.app, json_body("PUT", &uri, &json!({ "behaviour": "fullmarks" }))).await;
    assert_eq!(updated["behaviour"], "fullmarks");
    let (_, deleted) = send_json(&h.app, instructor("DELETE", &uri).body(Body::empty()).unwrap()).await;
    assert_eq!(deleted["discounted"], false);
}

#[tokio::test]
async fn access_change_needs_something_to_change() {
    let h = harness();
    let (status, _) = send_json(
        &h.app,
        json_body(
            "POST",
            "/resources/1/access-changes",
            &json!({ "description": "nothing", "usernames": ["amy"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, change) = send_json(
        &h.app,
        json_body(
            "POST",
            "/resources/1/access-changes",
            &json!({ "description": "extra go", "max_attempts": 3, "usernames": ["amy"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(change["max_attempts"], 3);
}

#[tokio::test]
async fn remark_data_is_in_review_mode() {
    let h = harness();
    let (status, body) = send_json(
        &h.app,
        instructor("GET", "/resources/1/remark/attempt-data?attempt_pks=3,5,999")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let cmis = body["cmis"].as_array().unwrap();
    assert_eq!(cmis.len(), 2);
    assert_eq!(cmis[0]["pk"], 3);
    assert_eq!(cmis[0]["cmi"]["cmi.mode"]["value"], "review");
    assert_eq!(cmis[0]["cmi"]["cmi.suspend_data"]["value"], "{\"q0\":1}");
}

#[tokio::test]
async fn remark_save_reports_partial_failure() {
    let h = harness();
    h.store.fail_writes_for(5);
    let req: RemarkSaveReq = serde_json::from_value(json!({
        "attempts": [
            { "pk": 3, "changed_keys": { "cmi.score.raw": "7" } },
            { "pk": 5, "changed_keys": { "cmi.score.raw": "8" } },
        ]
    }))
    .unwrap();

    let (status, body) = send_json(
        &h.app,
        json_body("POST", "/resources/1/remark/save", &serde_json::to_value(&req).unwrap()),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["saved"], json!([3]));
    assert!(body["message"].as_str().unwrap().contains("attempt 5"));

    let elements = h.store.scorm_elements(3).await.unwrap();
    let remarked = elements.iter().find(|e| e.key == "cmi.score.raw").unwrap();
    assert_eq!(h.store.remarked_by(remarked.id), Some(99));
}

#[tokio::test]
async fn remark_save_with_bad_body_keeps_the_envelope() {
    let h = harness();
    let req = instructor("POST", "/resources/1/remark/save")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send_json(&h.app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["saved"], json!([]));
}

fn exam_package(title: &str) -> Vec<u8> {
    use std::io::Write;

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = zip::write::FileOptions::default();
    zip.start_file("imsmanifest.xml", opts).unwrap();
    zip.write_all(
        format!(
            r#"<manifest><organizations default="o"><organization identifier="o"><title>{title}</title>
            <item identifier="i" identifierref="r"/></organization></organizations>
            <resources><resource identifier="r" href="index.html"/></resources></manifest>"#
        )
        .as_bytes(),
    )
    .unwrap();
    zip.finish().unwrap().into_inner()
}

fn upload(resource_id: i64, package: &[u8], safe_replacement: bool) -> Request<Body> {
    let boundary = "XBOUNDARYX";
    let mut body = Vec::new();
    if safe_replacement {
        body.extend_from_slice(
            format!("--{boundary}\r\nContent-Disposition: form-data; name=\"safe_replacement\"\r\n\r\non\r\n")
                .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"exam.zip\"\r\nContent-Type: application/zip\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(package);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    instructor("POST", &format!("/resources/{resource_id}/exams"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn exam_ids(store: &MemoryStore) -> Vec<Option<i64>> {
    store
        .attempts_for_resource(1)
        .await
        .unwrap()
        .iter()
        .map(|a| a.exam_id)
        .collect()
}

/// Uploads a first exam version and adds two attempts made against it,
/// after the harness's two attempts that have no exam. Returns its pk.
async fn first_version(h: &Harness) -> i64 {
    let (status, body) = send_json(&h.app, upload(1, &exam_package("Version 1"), false)).await;
    assert_eq!(status, StatusCode::CREATED);
    let exam_id = body["exam"]["id"].as_i64().unwrap();
    for start in [100, 110] {
        let mut a = attempt(1, 2, minutes(start), 0.5, 10.0);
        a.exam_id = Some(exam_id);
        h.store.add_attempt(a);
    }
    exam_id
}

#[tokio::test]
async fn uploading_an_exam_makes_it_live() {
    let h = harness();
    let (status, body) = send_json(&h.app, upload(1, &exam_package("Quiz"), false)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["exam"]["title"], "Quiz");
    assert_eq!(body["exam"]["launch_href"], "index.html");

    let resource = h.store.resource(1).await.unwrap().unwrap();
    assert_eq!(resource.exam_id, body["exam"]["id"].as_i64());
}

#[tokio::test]
async fn plain_replacement_leaves_old_attempts_on_their_exam() {
    let h = harness();
    let v1 = first_version(&h).await;

    let (status, body) = send_json(&h.app, upload(1, &exam_package("Version 2"), false)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["reassigned_attempts"], 0);
    let v2 = body["exam"]["id"].as_i64();
    assert_eq!(h.store.resource(1).await.unwrap().unwrap().exam_id, v2);
    assert_eq!(exam_ids(&h.store).await, vec![None, None, Some(v1), Some(v1)]);
}

#[tokio::test]
async fn safe_replacement_moves_attempts_to_the_new_exam() {
    let h = harness();
    first_version(&h).await;

    let (status, body) = send_json(&h.app, upload(1, &exam_package("Version 2"), true)).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["reassigned_attempts"], 2);
    let v2 = body["exam"]["id"].as_i64();
    assert_eq!(exam_ids(&h.store).await, vec![None, None, v2, v2]);
}

#[tokio::test]
async fn failed_reassignment_changes_nothing() {
    let h = harness();
    let v1 = first_version(&h).await;
    let locked = h.store.attempts_for_resource(1).await.unwrap()[3].id;
    h.store.fail_writes_for(locked);

    let (status, _) = send_json(&h.app, upload(1, &exam_package("Version 2"), true)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(exam_ids(&h.store).await, vec![None, None, Some(v1), Some(v1)]);
    assert_eq!(h.store.resource(1).await.unwrap().unwrap().exam_id, Some(v1));
}

#[tokio::test]
async fn restoring_an_old_version_leaves_attempts_alone() {
    let h = harness();
    let v1 = first_version(&h).await;
    let (_, body) = send_json(&h.app, upload(1, &exam_package("Version 2"), true)).await;
    let v2 = body["exam"]["id"].as_i64();

    let (status, restored) = send_json(
        &h.app,
        instructor("POST", &format!("/resources/1/exams/{v1}/restore"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["title"], "Version 1");
    assert_eq!(h.store.resource(1).await.unwrap().unwrap().exam_id, Some(v1));
    assert_eq!(exam_ids(&h.store).await, vec![None, None, v2, v2]);

    let (status, _) = send_json(
        &h.app,
        instructor("POST", "/resources/1/exams/404/restore")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rejected_package_is_not_kept() {
    use std::io::Write;

    let h = harness();
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    zip.start_file("index.html", zip::write::FileOptions::default())
        .unwrap();
    zip.write_all(b"<html></html>").unwrap();
    let package = zip.finish().unwrap().into_inner();

    let (status, body) = send_json(&h.app, upload(1, &package, false)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "imsmanifest.xml not found");
    let exams_dir = h.data.path().join("exams");
    let left = std::fs::read_dir(&exams_dir).map_or(0, |d| d.count());
    assert_eq!(left, 0);
    assert!(h.store.exams_for_resource(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn exam_list_merges_every_editors_exams() {
    let h = harness();
    let first = h.store.add_editor_link("Editor A", "https://a.example.com");
    let second = h.store.add_editor_link("Editor B", "https://b.example.com");
    h.store
        .save_editor_link_cache(first.id, json!([{ "name": "A1" }, { "name": "A2" }]), chrono::Utc::now())
        .await
        .unwrap();
    h.store
        .save_editor_link_cache(second.id, json!([{ "name": "B1" }]), chrono::Utc::now())
        .await
        .unwrap();

    let (status, body) =
        send_json(&h.app, instructor("GET", "/resources/1/exams").body(Body::empty()).unwrap()).await;

    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["available_exams"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["A1", "A2", "B1"]);
    assert_eq!(body["editor_links"].as_array().unwrap().len(), 2);

    let (status, _) = send_json(
        &h.app,
        instructor("POST", &format!("/editor-links/{}/refresh", second.id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        h.queue.submitted(),
        vec![Task::UpdateEditorLinkCache { editor_link_id: second.id }]
    );
}

#[tokio::test]
async fn user_filter_never_falls_back_to_a_name_search() {
    let h = harness();
    let rory = h.store.add_user("rory", "Rory", "Williams");
    h.store.add_attempt(attempt(1, rory.id, minutes(90), 0.3, 10.0));

    let get = |uri: &str| instructor("GET", uri).body(Body::empty()).unwrap();

    let (_, body) = send_json(&h.app, get(&format!("/resources/1/attempts?userid={}", rory.id))).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["query"], "Rory Williams");

    let (_, body) = send_json(&h.app, get("/resources/1/attempts?query=rory")).await;
    assert_eq!(body["total"], 1);

    // a malformed id lists everything instead of searching by name
    let (_, body) = send_json(&h.app, get("/resources/1/attempts?userid=abc&query=rory")).await;
    assert_eq!(body["total"], 3);
    assert_eq!(body["query"], "");
}
