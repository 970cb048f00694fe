//! 🩺 Repo health: the metrics that come with a traffic light.
//!
//! 🚦 Rows with a `Threshold` get a `threshold_count` and a red/green `threshold_status`.
//! Derived thresholds run a second query next to the first one; the ratio lives in the
//! `derive` function of the row that needs it.
//!
//! 🌱 The community rows (average ages, stars, forks, contributors) have no threshold.
//! They just get measured, like a kid against a door frame.

use anyhow::Result;
use serde_json::Value;

use super::codecov::{COVERAGE_INDEX, coverage_request, main_branch_snapshot};
use super::general::{issues_of, open_issues, open_pulls, untriaged_issues};
use super::{
    Extracted, ISSUES_INDEX, MetricDefinition, PULLS_INDEX, REPOS_INDEX, STATE_FIELD, Threshold,
    count_request, for_repo, total_hits,
};
use crate::query::{Aggregation, Filter, SearchRequest, SearchResponse};

const AUDIT_INDEX: &str = "github_audit";
const CONTRIBUTORS_INDEX: &str = "github_contributors";
const AVERAGE_AGG: &str = "average_days";
const CONTRIBUTORS_AGG: &str = "contributors_unique_keyword_count";
const THIRTY_DAYS_AGO: &str = "now-29d/d";
const WINDOW_START: &str = "now-30d/d";

// -- 🚦 a rounded fraction of a secondary count
fn ratio_of(response: &SearchResponse, ratio: f64) -> Result<i64> {
    Ok((response.total_hits()? as f64 * ratio).round() as i64)
}

fn five_percent(response: &SearchResponse) -> Result<i64> {
    ratio_of(response, 0.05)
}

fn three_percent(response: &SearchResponse) -> Result<i64> {
    ratio_of(response, 0.03)
}

fn two_percent(response: &SearchResponse) -> Result<i64> {
    ratio_of(response, 0.02)
}

// ===== filters =====

fn noncompliant_audit(repo: &str) -> Filter {
    for_repo(repo)
        .matching("audit_status.keyword", "noncompliant")
        .range("current_date", Some("now-1d"), Some("now"))
}

fn stale_untriaged_issues(repo: &str) -> Filter {
    untriaged_issues(repo).range("created_at", None, Some(THIRTY_DAYS_AGO))
}

// -- 📅 issues opened in the one-day window that just turned thirty
fn issues_turning_thirty(repo: &str) -> Filter {
    open_issues(repo).range("created_at", Some(WINDOW_START), Some(THIRTY_DAYS_AGO))
}

fn unanswered_issues_turning_thirty(repo: &str) -> Filter {
    issues_turning_thirty(repo).matching("comments", 0)
}

fn unanswered_pulls_turning_thirty(repo: &str) -> Filter {
    unanswered_pulls(repo).range("created_at", Some(WINDOW_START), Some(THIRTY_DAYS_AGO))
}

fn unanswered_stale_issues(repo: &str) -> Filter {
    open_issues(repo)
        .matching("comments", 0)
        .range("created_at", None, Some(THIRTY_DAYS_AGO))
}

fn unanswered_pulls(repo: &str) -> Filter {
    open_pulls(repo).matching("comments", 0)
}

fn unanswered_stale_pulls(repo: &str) -> Filter {
    unanswered_pulls(repo).range("created_at", None, Some(THIRTY_DAYS_AGO))
}

fn closed_issues(repo: &str) -> Filter {
    issues_of(repo).matching(STATE_FIELD, "closed")
}

fn merged_pulls(repo: &str) -> Filter {
    for_repo(repo).matching("merged", true)
}

// ===== requests + extractors =====

fn audit_status(response: &SearchResponse) -> Result<Extracted> {
    Ok(if response.total_hits()? > 0 {
        Extracted::Status { count: 1, value: "non-compliant".to_string() }
    } else {
        Extracted::Status { count: 0, value: "compliant".to_string() }
    })
}

fn coverage_percent(response: &SearchResponse) -> Result<Extracted> {
    let coverage = main_branch_snapshot(response).map_or(0.0, |snapshot| snapshot.coverage);
    Ok(Extracted::Count(coverage.round() as i64))
}

fn average_of(field: &str, filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter)
        .with_aggregation(AVERAGE_AGG, Aggregation::Avg { field: field.into() })
}

fn time_open_request(filter: Filter, index: &str) -> SearchRequest {
    average_of("time_open_days", filter, index)
}

fn time_to_close_request(filter: Filter, index: &str) -> SearchRequest {
    average_of("time_to_close_days", filter, index)
}

fn time_to_merge_request(filter: Filter, index: &str) -> SearchRequest {
    average_of("time_to_merge_days", filter, index)
}

fn average_days(response: &SearchResponse) -> Result<Extracted> {
    Ok(Extracted::Count(response.avg(AVERAGE_AGG)?.round() as i64))
}

fn contributors_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter)
        .with_aggregation(CONTRIBUTORS_AGG, Aggregation::Cardinality { field: "login.keyword".into() })
}

fn contributors(response: &SearchResponse) -> Result<Extracted> {
    Ok(Extracted::Count(response.cardinality(CONTRIBUTORS_AGG)?))
}

fn repo_stats_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter).with_source(
        1,
        &["forks_count", "stargazers_count", "subscribers_count", "size"],
    )
}

// -- 📄 the repo doc is the only source of truth for these; no doc, zero
fn repo_stat(response: &SearchResponse, field: &str) -> Result<Extracted> {
    Ok(Extracted::Count(
        response.first_source_field(field).and_then(Value::as_i64).unwrap_or(0),
    ))
}

fn forks(response: &SearchResponse) -> Result<Extracted> {
    repo_stat(response, "forks_count")
}

fn stars(response: &SearchResponse) -> Result<Extracted> {
    repo_stat(response, "stargazers_count")
}

fn subscribers(response: &SearchResponse) -> Result<Extracted> {
    repo_stat(response, "subscribers_count")
}

fn size(response: &SearchResponse) -> Result<Extracted> {
    repo_stat(response, "size")
}

const fn thresholded(
    name: &'static str,
    search_index: &'static str,
    build_filter: fn(&str) -> Filter,
    threshold: Threshold,
) -> MetricDefinition {
    MetricDefinition {
        name,
        search_index,
        build_filter,
        build_request: count_request,
        extract: total_hits,
        threshold: Some(threshold),
        precomputed: None,
    }
}

const fn measured(
    name: &'static str,
    search_index: &'static str,
    build_filter: fn(&str) -> Filter,
    build_request: fn(Filter, &str) -> SearchRequest,
    extract: fn(&SearchResponse) -> Result<Extracted>,
) -> MetricDefinition {
    MetricDefinition {
        name,
        search_index,
        build_filter,
        build_request,
        extract,
        threshold: None,
        precomputed: None,
    }
}

pub static DEFINITIONS: &[MetricDefinition] = &[
    MetricDefinition {
        name: "GitHub Audit",
        search_index: AUDIT_INDEX,
        build_filter: noncompliant_audit,
        build_request: count_request,
        extract: audit_status,
        threshold: Some(Threshold::Fixed(0)),
        precomputed: None,
    },
    thresholded(
        "Untriaged issues",
        ISSUES_INDEX,
        untriaged_issues,
        Threshold::Derived {
            search_index: ISSUES_INDEX,
            build_filter: open_issues,
            derive: five_percent,
        },
    ),
    thresholded(
        "Untriaged issues greater than 30 days",
        ISSUES_INDEX,
        stale_untriaged_issues,
        Threshold::Derived {
            search_index: ISSUES_INDEX,
            build_filter: issues_turning_thirty,
            derive: three_percent,
        },
    ),
    thresholded(
        "Issues older than 30 days and not responded",
        ISSUES_INDEX,
        unanswered_stale_issues,
        Threshold::Derived {
            search_index: ISSUES_INDEX,
            build_filter: unanswered_issues_turning_thirty,
            derive: two_percent,
        },
    ),
    thresholded(
        "Pull Requests not responded",
        PULLS_INDEX,
        unanswered_pulls,
        Threshold::Derived {
            search_index: PULLS_INDEX,
            build_filter: unanswered_pulls,
            derive: two_percent,
        },
    ),
    thresholded(
        "Pull Requests older than 30 days and not responded",
        PULLS_INDEX,
        unanswered_stale_pulls,
        Threshold::Derived {
            search_index: PULLS_INDEX,
            build_filter: unanswered_pulls_turning_thirty,
            derive: two_percent,
        },
    ),
    measured(
        "CodeCov Coverage Percentage",
        COVERAGE_INDEX,
        for_repo,
        coverage_request,
        coverage_percent,
    ),
    measured(
        "Average Issue Open Time: Measured in Days",
        ISSUES_INDEX,
        open_issues,
        time_open_request,
        average_days,
    ),
    measured(
        "Average Issue Close Time: Measured in Days",
        ISSUES_INDEX,
        closed_issues,
        time_to_close_request,
        average_days,
    ),
    measured(
        "Average Pull Request Merge Time: Measured in Days",
        PULLS_INDEX,
        merged_pulls,
        time_to_merge_request,
        average_days,
    ),
    measured("Contributors", CONTRIBUTORS_INDEX, for_repo, contributors_request, contributors),
    measured("Number of forks", REPOS_INDEX, for_repo, repo_stats_request, forks),
    measured("Number of stars", REPOS_INDEX, for_repo, repo_stats_request, stars),
    measured("Number of subscribers", REPOS_INDEX, for_repo, repo_stats_request, subscribers),
    measured("Repo size in megabytes (MB)", REPOS_INDEX, for_repo, repo_stats_request, size),
];
