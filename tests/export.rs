mod common;

use futures::TryStreamExt;
use lti_exam_runtime::export::{
    attempts_rows, json_dump_filename, json_dump_stream, scores_rows, Cell, SCORES_HEADERS,
};
use lti_exam_runtime::store::{MemoryStore, Store};
use std::sync::Arc;

use common::{attempt, minutes};

fn seeded() -> MemoryStore {
    let store = MemoryStore::new();
    let r = store.add_resource("Week 3 quiz", "week-3-quiz", "MAS1001 Calculus");
    let amy = store.add_user("amy", "Amy", "Pond");
    let rory = store.add_user("rory", "Rory", "Williams");
    let mut a = attempt(r.id, amy.id, minutes(0), 0.75, 8.0);
    a.question_scores = vec![3.0, 3.0];
    store.add_attempt(a);
    store.add_attempt(attempt(r.id, amy.id, minutes(30), 0.5, 8.0));
    let mut b = attempt(r.id, rory.id, minutes(10), 0.25, 8.0);
    b.question_scores = vec![1.0, 0.0, 1.0];
    let b = store.add_attempt(b);
    store.add_element(b.id, "cmi.location", "2", minutes(11));
    store.add_element(b.id, "cmi.location", "3", minutes(12));
    store
}

fn number(cell: &Cell) -> f64 {
    match cell {
        Cell::Number(n) => *n,
        other => panic!("expected a number, got {other:?}"),
    }
}

#[tokio::test]
async fn scores_have_a_row_per_student() {
    let store = seeded();
    let resource = store.resource(1).await.unwrap().unwrap();

    let rows = scores_rows(&store, &resource).await.unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], SCORES_HEADERS.iter().map(|h| Cell::from(*h)).collect::<Vec<_>>());
    for row in &rows[1..] {
        let (pct, raw, max) = (number(&row[4]), number(&row[5]), number(&row[6]));
        assert!((raw - pct / 100.0 * max).abs() < 1e-9);
    }
    assert_eq!(rows[1][3], Cell::from("amy"));
    assert_eq!(number(&rows[1][4]), 75.0);
}

#[tokio::test]
async fn attempts_get_a_column_per_question() {
    let store = seeded();
    let resource = store.resource(1).await.unwrap().unwrap();

    let rows = attempts_rows(&store, &resource).await.unwrap();

    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].len(), 9 + 3);
    assert_eq!(rows[0][11], Cell::from("Question 3"));
    // amy's first attempt answered two questions; the third is blank as zero
    assert_eq!(number(&rows[1][11]), 0.0);
    assert_eq!(number(&rows[2][9]), 1.0);
}

#[tokio::test]
async fn json_dump_streams_a_single_document() {
    let store: Arc<MemoryStore> = Arc::new(seeded());
    let resource = store.resource(1).await.unwrap().unwrap();
    let attempts = store.attempts_for_resource(1).await.unwrap();

    assert_eq!(json_dump_filename(&resource), "mas1001-calculus--week-3-quiz.json");

    let chunks: Vec<String> = json_dump_stream(store.clone(), resource, attempts, true)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(chunks.len(), 5);

    let doc: serde_json::Value = serde_json::from_str(&chunks.concat()).unwrap();
    assert_eq!(doc["resource"]["title"], "Week 3 quiz");
    let dumped = doc["attempts"].as_array().unwrap();
    assert_eq!(dumped.len(), 3);
    let rory = &dumped[1];
    assert_eq!(rory["user"]["username"], "rory");
    assert_eq!(rory["scorm_cmi"]["cmi.location"]["value"], "3");
    assert_eq!(rory["scorm_elements"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_resource_dumps_an_empty_list() {
    let store = Arc::new(MemoryStore::new());
    let resource = store.add_resource("Empty", "empty", "Course");

    let body: String = json_dump_stream(store.clone(), resource, vec![], false)
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .concat();
    let doc: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(doc["attempts"], serde_json::json!([]));
}
