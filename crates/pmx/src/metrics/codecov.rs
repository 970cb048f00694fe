//! 🧪 Code-coverage snapshots: one per repository per day, `main` branch only, filed into
//! a monthly index so a month of history sits in one place.
//!
//! The `codecov_coverage` index holds whatever the coverage collector last saw. We pull a
//! handful of hits, keep the first one on `main`, and write it down. No main? Then the
//! snapshot says so, with a zero and a `no-coverage` state, and still gets written.

use anyhow::Result;
use serde_json::Value;

use super::{CoverageSnapshot, Extracted, MetricDefinition, for_repo};
use crate::query::{Filter, SearchRequest, SearchResponse};

pub(crate) const COVERAGE_INDEX: &str = "codecov_coverage";
const MAIN_BRANCH: &str = "main";
const COVERAGE_FIELDS: &[&str] = &["branch", "commit_id", "state", "coverage", "url"];
// -- 🔍 enough hits to find `main` among a few feature branches
const COVERAGE_HITS: usize = 10;

pub(crate) fn coverage_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter).with_source(COVERAGE_HITS, COVERAGE_FIELDS)
}

fn text_field(source: &Value, field: &str, fallback: &str) -> String {
    match source.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => fallback.to_string(),
        Some(other) => other.to_string(),
    }
}

// -- 🔢 coverage shows up as 87.5 or "87.5" depending on who wrote the doc
fn coverage_value(source: &Value) -> f64 {
    match source.get("coverage") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// 🌳 The first `main`-branch hit, turned into a snapshot. `None` when main never showed up.
pub(crate) fn main_branch_snapshot(response: &SearchResponse) -> Option<CoverageSnapshot> {
    response
        .hits()
        .iter()
        .map(|hit| &hit.source)
        .find(|source| source.get("branch").and_then(Value::as_str) == Some(MAIN_BRANCH))
        .map(|source| CoverageSnapshot {
            branch: MAIN_BRANCH.to_string(),
            commit_id: text_field(source, "commit_id", "none"),
            state: text_field(source, "state", "none"),
            coverage: coverage_value(source),
            url: text_field(source, "url", "none"),
        })
}

fn no_coverage() -> CoverageSnapshot {
    CoverageSnapshot {
        branch: MAIN_BRANCH.to_string(),
        commit_id: "none".to_string(),
        state: "no-coverage".to_string(),
        coverage: 0.0,
        url: "none".to_string(),
    }
}

fn coverage_snapshot(response: &SearchResponse) -> Result<Extracted> {
    Ok(Extracted::Coverage(
        main_branch_snapshot(response).unwrap_or_else(no_coverage),
    ))
}

pub static DEFINITIONS: &[MetricDefinition] = &[MetricDefinition {
    name: "Code Coverage",
    search_index: COVERAGE_INDEX,
    build_filter: for_repo,
    build_request: coverage_request,
    extract: coverage_snapshot,
    threshold: None,
    precomputed: None,
}];
