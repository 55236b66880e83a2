//! CSV and JSON exports of a resource's results.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;

use crate::models::{Attempt, Resource, ScormElement, User};
use crate::outcome::grade_user;
use crate::scorm_diff;
use crate::store::{scorm_cmi, CmiValue, Store, StoreError, StoreResult};

pub const SCORES_HEADERS: [&str; 7] = [
    "First name",
    "Last name",
    "Email",
    "Username",
    "Percentage",
    "Raw score",
    "Max score",
];

pub const ATTEMPTS_HEADERS: [&str; 9] = [
    "First name",
    "Last name",
    "Email",
    "Username",
    "Start time",
    "End time",
    "Completed?",
    "Total score",
    "Percentage",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Time(Option<DateTime<Utc>>),
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<f64> for Cell {
    fn from(n: f64) -> Self {
        Cell::Number(n)
    }
}

impl Cell {
    fn render(&self) -> String {
        match self {
            Cell::Text(s) => s.clone(),
            Cell::Number(n) => n.to_string(),
            Cell::Time(Some(t)) => t.format("%Y-%m-%d %H:%M:%S%:z").to_string(),
            Cell::Time(None) => String::new(),
        }
    }
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn to_csv(rows: &[Vec<Cell>]) -> String {
    let mut out = String::new();
    for row in rows {
        let line: Vec<String> = row.iter().map(|c| csv_field(&c.render())).collect();
        out.push_str(&line.join(","));
        out.push_str("\r\n");
    }
    out
}

/// Lowercase ASCII words joined by hyphens.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c == '-') && !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

async fn user_rows(
    store: &dyn Store,
    resource: &Resource,
    user: &User,
) -> StoreResult<Vec<Cell>> {
    let source_id = store
        .user_data(resource.id, user.id)
        .await?
        .map(|d| d.source_id(user).to_string())
        .unwrap_or_else(|| user.username.clone());
    Ok(vec![
        user.first_name.as_str().into(),
        user.last_name.as_str().into(),
        user.email.as_str().into(),
        source_id.into(),
    ])
}

/// One row per student: their grade as a percentage, the raw score it
/// stands for, and the highest max score over their attempts.
pub async fn scores_rows(store: &dyn Store, resource: &Resource) -> StoreResult<Vec<Vec<Cell>>> {
    let attempts = store.attempts_for_resource(resource.id).await?;
    let mut rows: Vec<Vec<Cell>> = vec![SCORES_HEADERS.iter().map(|h| Cell::from(*h)).collect()];
    for student in store.students(resource.id).await? {
        let theirs: Vec<Attempt> = attempts
            .iter()
            .filter(|a| a.user_id == student.id)
            .cloned()
            .collect();
        let scaled = grade_user(&theirs, resource.grading_method);
        let max_score = theirs.iter().map(|a| a.max_score).fold(0.0, f64::max);
        let mut row = user_rows(store, resource, &student).await?;
        row.extend([
            Cell::Number(scaled * 100.0),
            Cell::Number(scaled * max_score),
            Cell::Number(max_score),
        ]);
        rows.push(row);
    }
    Ok(rows)
}

/// One row per attempt, with a column per question.
pub async fn attempts_rows(store: &dyn Store, resource: &Resource) -> StoreResult<Vec<Vec<Cell>>> {
    let attempts = store.attempts_for_resource(resource.id).await?;
    let num_questions = attempts.iter().map(|a| a.question_scores.len()).max().unwrap_or(0);

    let mut header: Vec<Cell> = ATTEMPTS_HEADERS.iter().map(|h| Cell::from(*h)).collect();
    header.extend((1..=num_questions).map(|n| Cell::Text(format!("Question {n}"))));
    let mut rows = vec![header];

    for attempt in &attempts {
        let Some(user) = store.user(attempt.user_id).await? else {
            continue;
        };
        let mut row = user_rows(store, resource, &user).await?;
        row.extend([
            Cell::Time(Some(attempt.start_time)),
            Cell::Time(attempt.end_time),
            Cell::Text(attempt.completion_status.to_string()),
            Cell::Number(attempt.raw_score),
            Cell::Number(attempt.scaled_score * 100.0),
        ]);
        row.extend((0..num_questions).map(|n| Cell::Number(attempt.question_raw_score(n))));
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Serialize)]
struct DumpUser<'a> {
    pk: i64,
    username: &'a str,
    first_name: &'a str,
    last_name: &'a str,
    email: &'a str,
}

#[derive(Serialize)]
struct DumpElement {
    key: String,
    value: String,
    time: DateTime<Utc>,
    counter: i32,
}

#[derive(Serialize)]
struct AttemptDump<'a> {
    pk: i64,
    user: Option<DumpUser<'a>>,
    exam: Option<i64>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    completion_status: &'static str,
    scaled_score: f64,
    raw_score: f64,
    max_score: f64,
    broken: bool,
    scorm_cmi: std::collections::BTreeMap<String, CmiValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scorm_elements: Option<Vec<DumpElement>>,
}

/// Serialized dump of one attempt. With `include_all_scorm`, the full
/// element history is replayed and included.
pub async fn attempt_dump(
    store: &dyn Store,
    attempt: &Attempt,
    include_all_scorm: bool,
) -> StoreResult<String> {
    let user = store.user(attempt.user_id).await?;
    let elements = store.scorm_elements(attempt.id).await?;
    let history = if include_all_scorm {
        let diffs = store.scorm_element_diffs(attempt.id).await?;
        let values = scorm_diff::reconstruct(&elements, &diffs)
            .map_err(|e| StoreError::Unavailable(format!("attempt {}: {e}", attempt.id)))?;
        Some(
            elements
                .iter()
                .map(|e: &ScormElement| DumpElement {
                    key: e.key.clone(),
                    value: values.get(&e.id).cloned().unwrap_or_default(),
                    time: e.time,
                    counter: e.counter,
                })
                .collect(),
        )
    } else {
        None
    };
    let dump = AttemptDump {
        pk: attempt.id,
        user: user.as_ref().map(|u| DumpUser {
            pk: u.id,
            username: &u.username,
            first_name: &u.first_name,
            last_name: &u.last_name,
            email: &u.email,
        }),
        exam: attempt.exam_id,
        start_time: attempt.start_time,
        end_time: attempt.end_time,
        completion_status: attempt.completion_status.as_str(),
        scaled_score: attempt.scaled_score,
        raw_score: attempt.raw_score,
        max_score: attempt.max_score,
        broken: attempt.broken,
        scorm_cmi: scorm_cmi(&elements),
        scorm_elements: history,
    };
    Ok(serde_json::to_string(&dump).unwrap_or_else(|_| "null".into()))
}

pub fn json_dump_filename(resource: &Resource) -> String {
    format!("{}--{}.json", slugify(&resource.context_name), resource.slug)
}

/// The JSON dump of a resource as a stream of chunks: a header, each
/// attempt's dump in turn, then a footer. Only one attempt is held in
/// memory at a time.
pub fn json_dump_stream(
    store: Arc<dyn Store>,
    resource: Resource,
    attempts: Vec<Attempt>,
    include_all_scorm: bool,
) -> impl Stream<Item = StoreResult<String>> + Send + 'static {
    let head = format!(
        "{{\n    \"resource\": {{\n        \"pk\": {},\n        \"title\": {}\n    }},\n    \"attempts\": [",
        resource.id,
        serde_json::Value::String(resource.title.clone())
    );
    let body = stream::iter(attempts.into_iter().enumerate()).then(move |(i, attempt)| {
        let store = store.clone();
        async move {
            let dump = attempt_dump(store.as_ref(), &attempt, include_all_scorm).await?;
            Ok(if i > 0 { format!(",{dump}") } else { dump })
        }
    });
    stream::once(async move { Ok(head) })
        .chain(body)
        .chain(stream::once(async { Ok("    ]\n}".to_string()) }))
}
