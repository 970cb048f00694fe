//! 📈 General metrics: the daily headcount of issues, pulls, comments, and reactions.
//!
//! One row per metric. Filters pin the repository first, then narrow down.
//! Sums ride on named aggregations so the extractor knows exactly where to look.

use anyhow::Result;

use super::{
    Extracted, ISSUES_INDEX, IS_PULL_REQUEST_FIELD, MetricDefinition, PULLS_INDEX, STATE_FIELD,
    count_request, for_repo, total_hits,
};
use crate::query::{Aggregation, Filter, SearchRequest, SearchResponse};

const COMMENTS_SUM: &str = "total_comments_sum";
const REACTIONS_SUM: &str = "total_reactions_sum";

// -- 🤖 the bots that comment on everything and mean nothing by it
const COMMENT_BOTS: &[&str] = &[
    "opensearch-trigger-bot[bot]",
    "dependabot[bot]",
    "mend-for-github-com[bot]",
    "opensearch-ci-bot",
];

/// 🐛 Issues (not PRs wearing an issue costume) for a repository.
pub(crate) fn issues_of(repo: &str) -> Filter {
    for_repo(repo).matching(IS_PULL_REQUEST_FIELD, false)
}

pub(crate) fn open_issues(repo: &str) -> Filter {
    issues_of(repo).matching(STATE_FIELD, "open")
}

pub(crate) fn open_pulls(repo: &str) -> Filter {
    for_repo(repo).matching(STATE_FIELD, "open")
}

pub(crate) fn untriaged_issues(repo: &str) -> Filter {
    open_issues(repo).matching("issue_labels.keyword", "untriaged")
}

fn uncommented_pulls(repo: &str) -> Filter {
    open_pulls(repo).matching("comments", 0)
}

fn unlabelled_pulls(repo: &str) -> Filter {
    open_pulls(repo).missing("pull_labels.keyword")
}

fn unlabelled_issues(repo: &str) -> Filter {
    open_issues(repo).missing("issue_labels.keyword")
}

fn merged_pulls(repo: &str) -> Filter {
    for_repo(repo).matching("merged", true)
}

fn closed_issues(repo: &str) -> Filter {
    issues_of(repo).matching(STATE_FIELD, "closed")
}

fn human_pull_comments(repo: &str) -> Filter {
    for_repo(repo).excluding("user_login.keyword", COMMENT_BOTS)
}

fn comments_sum_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter)
        .with_aggregation(COMMENTS_SUM, Aggregation::Sum { field: "comments".into() })
}

fn positive_reactions_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter)
        .with_aggregation(REACTIONS_SUM, Aggregation::Sum { field: "reactions_plus".into() })
}

fn negative_reactions_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter)
        .with_aggregation(REACTIONS_SUM, Aggregation::Sum { field: "reactions_minus".into() })
}

fn comments_sum(response: &SearchResponse) -> Result<Extracted> {
    Ok(Extracted::Count(response.sum(COMMENTS_SUM)? as i64))
}

fn reactions_sum(response: &SearchResponse) -> Result<Extracted> {
    Ok(Extracted::Count(response.sum(REACTIONS_SUM)? as i64))
}

const fn counted(
    name: &'static str,
    search_index: &'static str,
    build_filter: fn(&str) -> Filter,
) -> MetricDefinition {
    MetricDefinition {
        name,
        search_index,
        build_filter,
        build_request: count_request,
        extract: total_hits,
        threshold: None,
        precomputed: None,
    }
}

const fn summed(
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
    counted("Untriaged Issues", ISSUES_INDEX, untriaged_issues),
    counted("Uncommented Pull Requests", PULLS_INDEX, uncommented_pulls),
    counted("Unlabelled Pull Requests", PULLS_INDEX, unlabelled_pulls),
    counted("Unlabelled Issues", ISSUES_INDEX, unlabelled_issues),
    counted("Pull Requests Merged", PULLS_INDEX, merged_pulls),
    counted("Open Pull Requests", PULLS_INDEX, open_pulls),
    counted("Open Issues", ISSUES_INDEX, open_issues),
    counted("Closed Issues", ISSUES_INDEX, closed_issues),
    counted("Created Issues", ISSUES_INDEX, issues_of),
    summed("Issue Comments", ISSUES_INDEX, issues_of, comments_sum_request, comments_sum),
    summed("Pull Comments", PULLS_INDEX, human_pull_comments, comments_sum_request, comments_sum),
    summed(
        "Issue Positive Reactions",
        ISSUES_INDEX,
        issues_of,
        positive_reactions_request,
        reactions_sum,
    ),
    summed(
        "Issue Negative Reactions",
        ISSUES_INDEX,
        issues_of,
        negative_reactions_request,
        reactions_sum,
    ),
];
