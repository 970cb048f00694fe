//! 🚢 Release readiness: for every repository and every tracked release, how ready is it?
//!
//! 🎬 *[a release manager opens a dashboard. it is 11pm. the release is tomorrow.]*
//!
//! Unlike the other families this one isn't a table of per-repo rows. Every check is keyed
//! by (repository, release version), so one document per pair carries all of them:
//! - issues and pulls labelled `v{version}`, open and closed (plus the `autocut` issues
//!   the release bot files when a build breaks)
//! - the `[RELEASE] Release version {version}` tracking issue: its url and its assignees,
//!   who are, by convention, the release owners
//!
//! 🦆 Release state ("open" / "closed") comes from config, not the cluster. Somebody has to
//! decide when a release is over. It isn't going to be the duck.

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use super::{ISSUES_INDEX, IS_PULL_REQUEST_FIELD, PULLS_INDEX, STATE_FIELD, for_repo};
use crate::query::{Aggregation, Filter, SearchRequest, SearchResponse};

const ISSUE_LABEL_FIELD: &str = "issue_labels.keyword";
const PULL_LABEL_FIELD: &str = "pull_labels.keyword";
const AUTOCUT_LABEL: &str = "autocut";
const RELEASE_TITLE_PREFIX: &str = "[RELEASE] Release version ";
const OWNERS_AGG: &str = "issue_assignees";
// -- 👥 a release with more than fifty owners has no owner
const OWNERS_LIMIT: usize = 50;

/// 🏷️ One release we keep an eye on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseInput {
    /// `3.0.0`, not `v3.0.0`. The `v` is added where labels need it.
    pub version: String,
    /// "open" while the release is in flight, "closed" once it shipped.
    #[serde(default = "default_release_state")]
    pub state: String,
}

fn default_release_state() -> String {
    "open".to_string()
}

impl ReleaseInput {
    pub fn new(version: &str, state: &str) -> Self {
        Self {
            version: version.to_string(),
            state: state.to_string(),
        }
    }

    fn label(&self) -> String {
        format!("v{}", self.version)
    }
}

/// 📋 The releases tracked when config doesn't say otherwise.
pub fn tracked_releases() -> Vec<ReleaseInput> {
    [
        ("3.0.0", "open"),
        ("2.17.0", "closed"),
        ("2.18.0", "closed"),
        ("2.19.0", "open"),
        ("1.3.19", "closed"),
        ("1.3.20", "closed"),
    ]
    .into_iter()
    .map(|(version, state)| ReleaseInput::new(version, state))
    .collect()
}

fn labelled_issues(repo: &str, release: &ReleaseInput, state: &str) -> Filter {
    for_repo(repo)
        .matching(IS_PULL_REQUEST_FIELD, false)
        .matching(STATE_FIELD, state)
        .matching(ISSUE_LABEL_FIELD, release.label())
}

fn labelled_pulls(repo: &str, release: &ReleaseInput, state: &str) -> Filter {
    for_repo(repo)
        .matching(STATE_FIELD, state)
        .matching(PULL_LABEL_FIELD, release.label())
}

fn release_issue_filter(repo: &str, release: &ReleaseInput) -> Filter {
    for_repo(repo)
        .matching("title.keyword", format!("{RELEASE_TITLE_PREFIX}{}", release.version))
        .matching(IS_PULL_REQUEST_FIELD, false)
}

/// 📡 Every search one (repository, release) pair needs. They don't depend on each other.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseQueries {
    pub issues_open: SearchRequest,
    pub autocut_issues_open: SearchRequest,
    pub issues_closed: SearchRequest,
    pub pulls_open: SearchRequest,
    pub pulls_closed: SearchRequest,
    pub release_issue: SearchRequest,
}

impl ReleaseQueries {
    pub fn new(repo: &str, release: &ReleaseInput) -> Self {
        Self {
            issues_open: SearchRequest::count(ISSUES_INDEX, labelled_issues(repo, release, "open")),
            autocut_issues_open: SearchRequest::count(
                ISSUES_INDEX,
                labelled_issues(repo, release, "open").matching(ISSUE_LABEL_FIELD, AUTOCUT_LABEL),
            ),
            issues_closed: SearchRequest::count(ISSUES_INDEX, labelled_issues(repo, release, "closed")),
            pulls_open: SearchRequest::count(PULLS_INDEX, labelled_pulls(repo, release, "open")),
            pulls_closed: SearchRequest::count(PULLS_INDEX, labelled_pulls(repo, release, "closed")),
            release_issue: SearchRequest::count(ISSUES_INDEX, release_issue_filter(repo, release))
                .with_source(1, &["html_url"])
                .with_aggregation(
                    OWNERS_AGG,
                    Aggregation::Terms { field: "issue_assignees.keyword".into(), size: OWNERS_LIMIT },
                ),
        }
    }
}

/// 🎫 The release tracking issue, if anyone filed one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseIssue {
    pub url: Option<String>,
    /// Sorted, so reruns serialize identically.
    pub owners: Vec<String>,
}

/// 🎫 Read the tracking issue's url off the first hit and its owners off the assignee buckets.
pub fn release_issue(response: &SearchResponse) -> Result<ReleaseIssue> {
    let url = response
        .first_source_field("html_url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string);
    let mut owners: Vec<String> = response.terms(OWNERS_AGG)?.into_keys().collect();
    owners.sort();
    Ok(ReleaseIssue { url, owners })
}

/// 🚢 Everything measured for one (repository, release) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReadiness {
    pub issues_open: i64,
    pub autocut_issues_open: i64,
    pub issues_closed: i64,
    pub pulls_open: i64,
    pub pulls_closed: i64,
    pub issue: ReleaseIssue,
}
