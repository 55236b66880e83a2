#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use lti_exam_runtime::models::{Attempt, CompletionStatus, LtiUserData};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

pub fn minutes(n: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(n)
}

pub fn attempt(resource_id: i64, user_id: i64, start: DateTime<Utc>, scaled: f64, max: f64) -> Attempt {
    Attempt {
        id: 0,
        resource_id,
        user_id,
        exam_id: None,
        start_time: start,
        end_time: Some(start + Duration::minutes(30)),
        completion_status: CompletionStatus::Completed,
        scaled_score: scaled,
        raw_score: scaled * max,
        max_score: max,
        question_scores: vec![],
        diffed: false,
        broken: false,
    }
}

pub fn launch_data(resource_id: i64, user_id: i64) -> LtiUserData {
    LtiUserData {
        user_id,
        resource_id,
        consumer_key: Some("vle".into()),
        lis_result_sourcedid: Some(format!("src-{user_id}")),
        lis_outcome_service_url: Some("https://vle.example.com/outcomes".into()),
        lis_person_sourcedid: None,
        is_instructor: false,
    }
}
