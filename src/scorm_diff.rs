//! Space-saving compaction of SCORM element histories.
//!
//! Writes to the same CMI key are chained in (time, counter, pk) order. Each
//! element except the newest can be replaced by a patch that rebuilds it from
//! its successor's value, so replaying the chain backwards from the newest
//! element reproduces every historical value.

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

use crate::models::{ScormElement, ScormElementDiff};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    #[serde(rename = "=")]
    Keep(usize),
    #[serde(rename = "-")]
    Skip(usize),
    #[serde(rename = "+")]
    Insert(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed patch: {0}")]
    Malformed(String),
    #[error("patch runs past the end of its base value")]
    Overrun,
    #[error("element {0} is compacted against a missing element")]
    BrokenChain(i64),
}

/// Longest a single diff may search before settling for a coarser patch.
const DIFF_DEADLINE: Duration = Duration::from_millis(500);

/// Character-level patch turning `base` into `target`.
///
/// Past [`DIFF_DEADLINE`] the patch stops being minimal but still rebuilds
/// `target` exactly.
pub fn make_patch(base: &str, target: &str) -> Vec<PatchOp> {
    let diff = TextDiff::configure()
        .timeout(DIFF_DEADLINE)
        .diff_chars(base, target);
    let mut ops: Vec<PatchOp> = Vec::new();
    for change in diff.iter_all_changes() {
        let text = change.value();
        let n = text.chars().count();
        match (change.tag(), ops.last_mut()) {
            (ChangeTag::Equal, Some(PatchOp::Keep(k))) => *k += n,
            (ChangeTag::Equal, _) => ops.push(PatchOp::Keep(n)),
            (ChangeTag::Delete, Some(PatchOp::Skip(k))) => *k += n,
            (ChangeTag::Delete, _) => ops.push(PatchOp::Skip(n)),
            (ChangeTag::Insert, Some(PatchOp::Insert(s))) => s.push_str(text),
            (ChangeTag::Insert, _) => ops.push(PatchOp::Insert(text.to_string())),
        }
    }
    ops
}

pub fn apply_patch(base: &str, ops: &[PatchOp]) -> Result<String, PatchError> {
    let mut chars = base.chars();
    let mut out = String::with_capacity(base.len());
    for op in ops {
        match op {
            PatchOp::Keep(n) => {
                for _ in 0..*n {
                    out.push(chars.next().ok_or(PatchError::Overrun)?);
                }
            }
            PatchOp::Skip(n) => {
                for _ in 0..*n {
                    chars.next().ok_or(PatchError::Overrun)?;
                }
            }
            PatchOp::Insert(s) => out.push_str(s),
        }
    }
    Ok(out)
}

pub fn encode_patch(ops: &[PatchOp]) -> String {
    // Vec<PatchOp> only holds strings and integers
    serde_json::to_string(ops).unwrap_or_default()
}

pub fn decode_patch(patch: &str) -> Result<Vec<PatchOp>, PatchError> {
    serde_json::from_str(patch).map_err(|e| PatchError::Malformed(e.to_string()))
}

fn chains(elements: &[ScormElement]) -> BTreeMap<&str, Vec<&ScormElement>> {
    let mut by_key: BTreeMap<&str, Vec<&ScormElement>> = BTreeMap::new();
    for e in elements {
        by_key.entry(e.key.as_str()).or_default().push(e);
    }
    for chain in by_key.values_mut() {
        chain.sort_by_key(|e| (e.time, e.counter, e.id));
    }
    by_key
}

/// Full value of every element, undoing any existing compaction.
pub fn reconstruct(
    elements: &[ScormElement],
    diffs: &[ScormElementDiff],
) -> Result<HashMap<i64, String>, PatchError> {
    let diffs: HashMap<i64, &ScormElementDiff> = diffs.iter().map(|d| (d.element_id, d)).collect();
    let mut values: HashMap<i64, String> = HashMap::with_capacity(elements.len());
    for chain in chains(elements).values() {
        for e in chain.iter().rev() {
            let value = match diffs.get(&e.id) {
                Some(d) => {
                    let base = values
                        .get(&d.diff_against_id)
                        .ok_or(PatchError::BrokenChain(e.id))?;
                    apply_patch(base, &decode_patch(&d.patch)?)?
                }
                None => e.value.clone(),
            };
            values.insert(e.id, value);
        }
    }
    Ok(values)
}

/// Diffs to write for one attempt's history.
///
/// Only elements not already compacted are considered, and a diff is kept
/// only when its patch is shorter than the value it replaces.
pub fn compact(
    elements: &[ScormElement],
    existing: &[ScormElementDiff],
) -> Result<Vec<ScormElementDiff>, PatchError> {
    let values = reconstruct(elements, existing)?;
    let already: std::collections::HashSet<i64> = existing.iter().map(|d| d.element_id).collect();
    let mut out = Vec::new();
    for chain in chains(elements).values() {
        for pair in chain.windows(2) {
            let (older, newer) = (pair[0], pair[1]);
            if already.contains(&older.id) {
                continue;
            }
            let (Some(old_value), Some(new_value)) = (values.get(&older.id), values.get(&newer.id))
            else {
                continue;
            };
            let patch = encode_patch(&make_patch(new_value, old_value));
            if patch.len() < old_value.len() {
                out.push(ScormElementDiff {
                    element_id: older.id,
                    diff_against_id: newer.id,
                    patch,
                });
            }
        }
    }
    Ok(out)
}
