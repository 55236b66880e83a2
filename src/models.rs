use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, value: s.to_string() }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;

            fn try_from(s: String) -> Result<Self, UnknownVariant> {
                s.parse()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "&'static str")]
pub enum CompletionStatus {
    NotAttempted,
    Incomplete,
    Completed,
    Passed,
    Failed,
    Browsed,
    Unknown,
}

text_enum!(CompletionStatus, "completion status", {
    NotAttempted => "not attempted",
    Incomplete => "incomplete",
    Completed => "completed",
    Passed => "passed",
    Failed => "failed",
    Browsed => "browsed",
    Unknown => "unknown",
});

impl CompletionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            CompletionStatus::NotAttempted => "Not attempted",
            CompletionStatus::Incomplete => "Incomplete",
            CompletionStatus::Completed => "Complete",
            CompletionStatus::Passed => "Passed",
            CompletionStatus::Failed => "Failed",
            CompletionStatus::Browsed => "Browsed",
            CompletionStatus::Unknown => "Unknown",
        }
    }
}

impl From<CompletionStatus> for &'static str {
    fn from(s: CompletionStatus) -> Self {
        s.as_str()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "&'static str")]
pub enum ReportProcessStatus {
    Reporting,
    Complete,
    Error,
}

text_enum!(ReportProcessStatus, "report process status", {
    Reporting => "reporting",
    Complete => "complete",
    Error => "error",
});

impl From<ReportProcessStatus> for &'static str {
    fn from(s: ReportProcessStatus) -> Self {
        s.as_str()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "&'static str")]
pub enum GradingMethod {
    Highest,
    Last,
}

text_enum!(GradingMethod, "grading method", {
    Highest => "highest",
    Last => "last",
});

impl From<GradingMethod> for &'static str {
    fn from(g: GradingMethod) -> Self {
        g.as_str()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "&'static str")]
pub enum DiscountBehaviour {
    Remove,
    FullMarks,
}

text_enum!(DiscountBehaviour, "discount behaviour", {
    Remove => "remove",
    FullMarks => "fullmarks",
});

impl From<DiscountBehaviour> for &'static str {
    fn from(b: DiscountBehaviour) -> Self {
        b.as_str()
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Resource {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub context_name: String,
    pub exam_id: Option<i64>,
    #[sqlx(try_from = "String")]
    pub grading_method: GradingMethod,
    pub max_attempts: i32,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Exam {
    pub id: i64,
    pub title: String,
    pub resource_id: Option<i64>,
    pub launch_href: String,
    pub base_path: String, // relative to DATA_DIR, e.g. "exams/<uuid>"
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewExam {
    pub title: String,
    pub resource_id: i64,
    pub launch_href: String,
    pub base_path: String,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Launch data the LTI consumer sent for one user in one resource.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct LtiUserData {
    pub user_id: i64,
    pub resource_id: i64,
    pub consumer_key: Option<String>,
    pub lis_result_sourcedid: Option<String>,
    pub lis_outcome_service_url: Option<String>,
    pub lis_person_sourcedid: Option<String>,
    pub is_instructor: bool,
}

impl LtiUserData {
    /// Identifier the consumer knows the student by, falling back to the username.
    pub fn source_id<'a>(&'a self, user: &'a User) -> &'a str {
        self.lis_person_sourcedid
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&user.username)
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Attempt {
    pub id: i64,
    pub resource_id: i64,
    pub user_id: i64,
    pub exam_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub completion_status: CompletionStatus,
    pub scaled_score: f64,
    pub raw_score: f64,
    pub max_score: f64,
    pub question_scores: Vec<f64>,
    pub diffed: bool,
    pub broken: bool,
}

impl Attempt {
    pub fn question_raw_score(&self, n: usize) -> f64 {
        self.question_scores.get(n).copied().unwrap_or(0.0)
    }
}

/// One timestamped write against an attempt's runtime state.
///
/// Once compacted, `value` is empty and the element's history lives in a
/// [`ScormElementDiff`] against its successor.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScormElement {
    pub id: i64,
    pub attempt_id: i64,
    pub key: String,
    pub value: String,
    pub time: DateTime<Utc>,
    pub counter: i32,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScormElementDiff {
    pub element_id: i64,
    pub diff_against_id: i64,
    pub patch: String,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct ReportProcess {
    pub id: i64,
    pub resource_id: i64,
    #[sqlx(try_from = "String")]
    pub status: ReportProcessStatus,
    pub response: Option<String>,
    pub dismissed: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct DiscountPart {
    pub id: i64,
    pub resource_id: i64,
    pub part: String,
    #[sqlx(try_from = "String")]
    pub behaviour: DiscountBehaviour,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct AccessToken {
    pub id: i64,
    pub resource_id: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

/// A deadline extension or attempt allowance for a list of students.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct AccessChange {
    pub id: i64,
    pub resource_id: i64,
    pub description: String,
    pub extend_deadline: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
    pub usernames: Vec<String>,
    pub emails: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AccessChangeReq {
    pub description: String,
    #[serde(default)]
    pub extend_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default)]
    pub usernames: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct EditorLink {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub cached_available_exams: serde_json::Value,
    pub last_cache_update: Option<DateTime<Utc>>,
}

impl EditorLink {
    pub fn available_exams(&self) -> Vec<serde_json::Value> {
        self.cached_available_exams
            .as_array()
            .cloned()
            .unwrap_or_default()
    }
}

/// Changed CMI keys for one attempt, submitted after remarking.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemarkedAttemptReq {
    pub pk: i64,
    pub changed_keys: std::collections::BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemarkSaveReq {
    pub attempts: Vec<RemarkedAttemptReq>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_status_round_trips_through_text() {
        for s in CompletionStatus::ALL {
            assert_eq!(s.as_str().parse::<CompletionStatus>().unwrap(), *s);
        }
        assert!("finished".parse::<CompletionStatus>().is_err());
    }

    #[test]
    fn source_id_falls_back_to_username() {
        let user = User {
            id: 1,
            username: "jbloggs".into(),
            first_name: "Joe".into(),
            last_name: "Bloggs".into(),
            email: "j@example.com".into(),
        };
        let mut data = LtiUserData {
            user_id: 1,
            resource_id: 1,
            consumer_key: None,
            lis_result_sourcedid: None,
            lis_outcome_service_url: None,
            lis_person_sourcedid: Some(String::new()),
            is_instructor: false,
        };
        assert_eq!(data.source_id(&user), "jbloggs");
        data.lis_person_sourcedid = Some("s1234".into());
        assert_eq!(data.source_id(&user), "s1234");
    }
}
