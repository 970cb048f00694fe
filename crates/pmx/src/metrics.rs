//! 📊 metrics.rs: the catalogue. Every number we compute, written down as data.
//!
//! 🎯 A `MetricDefinition` is a row in a table: a name, the index it searches, a filter
//! builder, a request builder, and one extraction function. No giant match on metric names.
//! No "case UNTRIAGED: ... case UNLABELLED: ... oops forgot the break". Add a row, get a metric.
//!
//! 🗂️ Families group rows and decide where documents land:
//! - `general-metrics` → `opensearch_general_metrics`, daily ids
//! - `label-metrics` → `opensearch_label_metrics`, daily ids, one doc per label
//! - `repo-health` → `opensearch_repo_health_metrics`, daily ids, red/green thresholds
//! - `release-metrics` → `opensearch_release_metrics`, daily ids, one doc per (repo, release)
//! - `codecov-metrics` → `opensearch-codecov-metrics-MM-yyyy`, daily ids in a monthly index
//!
//! 🦆 The duck counts too. It always reports zero. We emit the zero anyway.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::doc_id::DateBucket;
use crate::query::{Filter, SearchRequest, SearchResponse};

pub mod codecov;
pub mod general;
pub mod health;
pub mod labels;
pub mod release;

// -- 🔤 fields and values every GitHub-sourced filter keeps reaching for
pub(crate) const REPOSITORY_FIELD: &str = "repository.keyword";
pub(crate) const STATE_FIELD: &str = "state.keyword";
pub(crate) const IS_PULL_REQUEST_FIELD: &str = "issue_pull_request";
pub(crate) const ISSUES_INDEX: &str = "github_issues";
pub(crate) const PULLS_INDEX: &str = "github_pulls";
pub(crate) const REPOS_INDEX: &str = "github_repos";

/// 🧱 Every GitHub filter starts by pinning the repository.
pub(crate) fn for_repo(repo: &str) -> Filter {
    Filter::new().matching(REPOSITORY_FIELD, repo)
}

/// 🔢 The default request shape: just count the hits.
pub(crate) fn count_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter)
}

/// 🔢 The default extraction: the hit count, nothing more.
pub(crate) fn total_hits(response: &SearchResponse) -> Result<Extracted> {
    Ok(Extracted::Count(response.total_hits()?))
}

/// 🏷️ Which side of the label ledger a label count belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelSide {
    Issues,
    Pulls,
}

/// 🧪 A main-branch coverage snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageSnapshot {
    pub branch: String,
    pub commit_id: String,
    pub state: String,
    pub coverage: f64,
    pub url: String,
}

/// 📦 What one extraction function pulled out of one response.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    /// A plain number.
    Count(i64),
    /// A number with a human label attached ("compliant" / "non-compliant").
    Status { count: i64, value: String },
    /// Label name → count, for one side of the label ledger.
    Labels { side: LabelSide, counts: HashMap<String, i64> },
    Coverage(CoverageSnapshot),
}

/// 🚦 How the threshold for a metric is obtained.
#[derive(Debug, Clone, Copy)]
pub enum Threshold {
    /// Same number every time. The audit lives here (anything above zero is red).
    Fixed(i64),
    /// A secondary query, run alongside the primary one.
    Derived {
        search_index: &'static str,
        build_filter: fn(&str) -> Filter,
        derive: fn(&SearchResponse) -> Result<i64>,
    },
}

/// 🚦 Red means over the threshold. Green means everyone can go home.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdStatus {
    Red,
    Green,
}

impl ThresholdStatus {
    pub fn evaluate(count: i64, threshold: i64) -> Self {
        if count > threshold {
            ThresholdStatus::Red
        } else {
            ThresholdStatus::Green
        }
    }
}

/// 🗃️ For map-valued metrics: one cross-repository nested terms query instead of one per repo.
#[derive(Debug, Clone, Copy)]
pub struct PrecomputedLookup {
    pub side: LabelSide,
    /// The filter without the repository pin.
    pub shared_filter: fn() -> Filter,
    pub label_field: &'static str,
}

/// 📏 One row of the catalogue.
#[derive(Debug, Clone, Copy)]
pub struct MetricDefinition {
    pub name: &'static str,
    pub search_index: &'static str,
    pub build_filter: fn(&str) -> Filter,
    pub build_request: fn(Filter, &str) -> SearchRequest,
    pub extract: fn(&SearchResponse) -> Result<Extracted>,
    pub threshold: Option<Threshold>,
    pub precomputed: Option<PrecomputedLookup>,
}

impl MetricDefinition {
    /// 🔍 Filter + request for one repository, in one go.
    pub fn request_for(&self, repo: &str) -> SearchRequest {
        (self.build_request)((self.build_filter)(repo), self.search_index)
    }
}

/// 🗂️ The families we know how to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FamilyKind {
    GeneralMetrics,
    LabelMetrics,
    RepoHealth,
    ReleaseMetrics,
    CodecovMetrics,
}

impl FamilyKind {
    pub const ALL: [FamilyKind; 5] = [
        FamilyKind::GeneralMetrics,
        FamilyKind::LabelMetrics,
        FamilyKind::RepoHealth,
        FamilyKind::ReleaseMetrics,
        FamilyKind::CodecovMetrics,
    ];

    /// 🔤 The name that goes into ids and logs.
    pub fn name(&self) -> &'static str {
        match self {
            FamilyKind::GeneralMetrics => "general-metrics",
            FamilyKind::LabelMetrics => "label-metrics",
            FamilyKind::RepoHealth => "repo-health",
            FamilyKind::ReleaseMetrics => "release-metrics",
            FamilyKind::CodecovMetrics => "codecov-metrics",
        }
    }

    /// 🪪 The bucket hashed into ids. Daily, for everyone: each day's run keeps its own
    /// document, even when it lands in a monthly index next to the rest of the month.
    pub fn id_bucket(&self, date: NaiveDate) -> DateBucket {
        DateBucket::Day(date)
    }

    /// 📅 The bucket suffixed onto the index name, for families that roll over monthly.
    pub fn index_bucket(&self, date: NaiveDate) -> Option<DateBucket> {
        match self {
            FamilyKind::CodecovMetrics => Some(DateBucket::Month(date)),
            _ => None,
        }
    }

    /// 📍 Destination index. Monthly families get the bucket as a suffix.
    pub fn index_name(&self, date: NaiveDate) -> String {
        let base = match self {
            FamilyKind::GeneralMetrics => "opensearch_general_metrics",
            FamilyKind::LabelMetrics => "opensearch_label_metrics",
            FamilyKind::RepoHealth => "opensearch_repo_health_metrics",
            FamilyKind::ReleaseMetrics => "opensearch_release_metrics",
            FamilyKind::CodecovMetrics => "opensearch-codecov-metrics",
        };
        match self.index_bucket(date) {
            Some(bucket) => format!("{base}-{bucket}"),
            None => base.to_string(),
        }
    }

    /// 📏 The family's per-repository rows. Release readiness is keyed by (repository,
    /// release) instead and lives in `release`, so it has none.
    pub fn definitions(&self) -> &'static [MetricDefinition] {
        match self {
            FamilyKind::GeneralMetrics => general::DEFINITIONS,
            FamilyKind::LabelMetrics => labels::DEFINITIONS,
            FamilyKind::RepoHealth => health::DEFINITIONS,
            FamilyKind::ReleaseMetrics => &[],
            FamilyKind::CodecovMetrics => codecov::DEFINITIONS,
        }
    }
}

impl std::fmt::Display for FamilyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FamilyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        FamilyKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "💀 Unknown metric family '{}'. We know: {}. We looked. It isn't hiding.",
                    s,
                    FamilyKind::ALL.map(|k| k.name()).join(", ")
                )
            })
    }
}
