//! 📄 documents.rs: what lands in the index, and the batch that carries it there.
//!
//! 🎯 Documents are flat, snake_case, and emit their zeros. A `metric_count` of 0 is a fact,
//! not an absence, and dashboards that can't find a field draw a gap instead of a zero.
//!
//! 📦 A `DocumentBatch` is built once by the orchestrator and then frozen. The bulk writer
//! gets an `Arc` of it and only ever reads. Ids are sorted, entries are contiguous, and
//! partitions are just ranges into that slice.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::doc_id::{DateBucket, doc_id};
use crate::metrics::release::{ReleaseInput, ReleaseReadiness};
use crate::metrics::{CoverageSnapshot, FamilyKind, ThresholdStatus};

/// 🕰️ The `current_date` every document of a run shares.
pub fn render_run_timestamp(run_at: DateTime<Utc>) -> String {
    run_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 🪪 Anything that knows its own id and can be serialized into a body.
pub trait Document: Serialize {
    fn id(&self) -> &str;
}

/// 📊 One scalar (or status) metric for one repository on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDocument {
    pub id: String,
    pub current_date: String,
    pub repository: String,
    pub metric_name: String,
    pub metric_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_status: Option<ThresholdStatus>,
}

impl MetricDocument {
    pub fn new(
        family: FamilyKind,
        bucket: DateBucket,
        current_date: &str,
        repository: &str,
        metric_name: &str,
        metric_count: i64,
    ) -> Self {
        Self {
            id: doc_id(family.name(), metric_name, bucket, repository),
            current_date: current_date.to_string(),
            repository: repository.to_string(),
            metric_name: metric_name.to_string(),
            metric_count,
            metric_string_value: None,
            threshold_count: None,
            threshold_status: None,
        }
    }

    pub fn with_string_value(mut self, value: String) -> Self {
        self.metric_string_value = Some(value);
        self
    }

    /// 🚦 Attach a threshold and the color it implies.
    pub fn with_threshold(mut self, threshold: i64) -> Self {
        self.threshold_status = Some(ThresholdStatus::evaluate(self.metric_count, threshold));
        self.threshold_count = Some(threshold);
        self
    }
}

impl Document for MetricDocument {
    fn id(&self) -> &str {
        &self.id
    }
}

/// 🏷️ One label's issue and pull counts for one repository on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelDocument {
    pub id: String,
    pub current_date: String,
    pub repository: String,
    pub label_name: String,
    pub label_issue_count: i64,
    pub label_pull_count: i64,
}

impl LabelDocument {
    pub fn new(
        bucket: DateBucket,
        current_date: &str,
        repository: &str,
        label_name: &str,
        label_issue_count: i64,
        label_pull_count: i64,
    ) -> Self {
        Self {
            id: doc_id(FamilyKind::LabelMetrics.name(), label_name, bucket, repository),
            current_date: current_date.to_string(),
            repository: repository.to_string(),
            label_name: label_name.to_string(),
            label_issue_count,
            label_pull_count,
        }
    }
}

impl Document for LabelDocument {
    fn id(&self) -> &str {
        &self.id
    }
}

/// 🧪 One coverage snapshot per repository per day. The index rolls over monthly; the ids don't.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeCoverageDocument {
    pub id: String,
    pub current_date: String,
    pub repository: String,
    pub branch: String,
    pub commit_id: String,
    pub state: String,
    pub coverage: f64,
    pub url: String,
}

impl CodeCoverageDocument {
    pub fn new(
        bucket: DateBucket,
        current_date: &str,
        repository: &str,
        snapshot: CoverageSnapshot,
    ) -> Self {
        Self {
            id: doc_id(FamilyKind::CodecovMetrics.name(), &snapshot.branch, bucket, repository),
            current_date: current_date.to_string(),
            repository: repository.to_string(),
            branch: snapshot.branch,
            commit_id: snapshot.commit_id,
            state: snapshot.state,
            coverage: snapshot.coverage,
            url: snapshot.url,
        }
    }
}

impl Document for CodeCoverageDocument {
    fn id(&self) -> &str {
        &self.id
    }
}

/// 🚢 One (repository, release) readiness check. `release_issue` stays `null` when nobody
/// filed the tracking issue; the `_exists` flags are there so dashboards don't have to ask.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseDocument {
    pub id: String,
    pub current_date: String,
    pub repository: String,
    pub release_version: String,
    pub version: String,
    pub release_state: String,
    pub issues_open: i64,
    pub autocut_issues_open: i64,
    pub issues_closed: i64,
    pub pulls_open: i64,
    pub pulls_closed: i64,
    pub release_owners: Vec<String>,
    pub release_owner_exists: bool,
    pub release_issue: Option<String>,
    pub release_issue_exists: bool,
}

impl ReleaseDocument {
    pub fn new(
        bucket: DateBucket,
        current_date: &str,
        repository: &str,
        release: &ReleaseInput,
        readiness: ReleaseReadiness,
    ) -> Self {
        let ReleaseReadiness {
            issues_open,
            autocut_issues_open,
            issues_closed,
            pulls_open,
            pulls_closed,
            issue,
        } = readiness;
        Self {
            id: doc_id(FamilyKind::ReleaseMetrics.name(), &release.version, bucket, repository),
            current_date: current_date.to_string(),
            repository: repository.to_string(),
            release_version: release.version.clone(),
            version: release.version.clone(),
            release_state: release.state.clone(),
            issues_open,
            autocut_issues_open,
            issues_closed,
            pulls_open,
            pulls_closed,
            release_owner_exists: !issue.owners.is_empty(),
            release_owners: issue.owners,
            release_issue_exists: issue.url.is_some(),
            release_issue: issue.url,
        }
    }
}

impl Document for ReleaseDocument {
    fn id(&self) -> &str {
        &self.id
    }
}

/// 📦 One serialized document, ready for an NDJSON line pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub id: String,
    pub body: String,
}

/// 🧊 id → body, frozen. No `insert`, no `remove`, no `&mut` anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentBatch {
    entries: Vec<BatchEntry>,
}

impl DocumentBatch {
    pub fn builder() -> DocumentBatchBuilder {
        DocumentBatchBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries
            .binary_search_by(|e| e.id.as_str().cmp(id))
            .ok()
            .map(|i| self.entries[i].body.as_str())
    }
}

/// 🏗️ The only way to make a batch. Owned by the orchestrator during assembly.
#[derive(Debug, Default)]
pub struct DocumentBatchBuilder {
    entries: BTreeMap<String, String>,
}

impl DocumentBatchBuilder {
    /// ➕ Serialize and add. Same id twice? The later one wins. Don't do that.
    pub fn insert<D: Document>(&mut self, document: &D) -> Result<()> {
        let body = serde_json::to_string(document).with_context(|| {
            format!("💀 Document '{}' refused to become JSON. Rare, but here we are.", document.id())
        })?;
        if self.entries.insert(document.id().to_string(), body).is_some() {
            debug!("♻️ Document '{}' was inserted twice; the later one wins", document.id());
        }
        Ok(())
    }

    pub fn build(self) -> DocumentBatch {
        DocumentBatch {
            entries: self
                .entries
                .into_iter()
                .map(|(id, body)| BatchEntry { id, body })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::{Value, json};

    fn the_bucket() -> DateBucket {
        DateBucket::Day(NaiveDate::from_ymd_opt(2024, 5, 1).expect("💀 May Day exists"))
    }

    #[test]
    fn the_one_where_zero_is_a_number_not_a_missing_field() {
        let the_doc = MetricDocument::new(
            FamilyKind::GeneralMetrics,
            the_bucket(),
            "2024-05-01T00:00:00.000Z",
            "alpha",
            "Open Issues",
            0,
        );
        let body: Value = serde_json::to_value(&the_doc).expect("💀 serialize");
        assert_eq!(
            body,
            json!({
                "id": the_doc.id,
                "current_date": "2024-05-01T00:00:00.000Z",
                "repository": "alpha",
                "metric_name": "Open Issues",
                "metric_count": 0
            })
        );
    }

    #[test]
    fn the_one_where_thresholds_and_labels_serialize_in_snake_case() {
        let the_doc = MetricDocument::new(
            FamilyKind::RepoHealth,
            the_bucket(),
            "t",
            "alpha",
            "GitHub Audit",
            1,
        )
        .with_string_value("non-compliant".into())
        .with_threshold(0);
        let body: Value = serde_json::to_value(&the_doc).expect("💀 serialize");
        assert_eq!(body["threshold_count"], 0);
        assert_eq!(body["threshold_status"], "red");
        assert_eq!(body["metric_string_value"], "non-compliant");

        let the_label = LabelDocument::new(the_bucket(), "t", "alpha", "bug", 0, 4);
        let body: Value = serde_json::to_value(&the_label).expect("💀 serialize");
        assert_eq!(body["label_issue_count"], 0);
        assert_eq!(body["label_pull_count"], 4);
    }

    #[test]
    fn the_one_where_the_later_insert_wins_and_the_batch_is_sorted() {
        let mut the_builder = DocumentBatch::builder();
        let first = LabelDocument::new(the_bucket(), "t", "alpha", "bug", 1, 1);
        let second = LabelDocument::new(the_bucket(), "t", "alpha", "bug", 2, 2);
        let other = LabelDocument::new(the_bucket(), "t", "beta", "bug", 3, 3);
        the_builder.insert(&first).expect("insert");
        the_builder.insert(&other).expect("insert");
        the_builder.insert(&second).expect("insert");
        let the_batch = the_builder.build();

        assert_eq!(the_batch.len(), 2);
        let body: Value =
            serde_json::from_str(the_batch.get(&first.id).expect("💀 id should be present"))
                .expect("💀 body is JSON");
        assert_eq!(body["label_issue_count"], 2);
        let ids: Vec<_> = the_batch.ids().collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn the_one_where_a_release_without_a_tracking_issue_says_so_out_loud() {
        let the_release = ReleaseInput::new("3.0.0", "open");
        let the_doc = ReleaseDocument::new(
            the_bucket(),
            "t",
            "alpha",
            &the_release,
            ReleaseReadiness { issues_open: 4, pulls_closed: 2, ..ReleaseReadiness::default() },
        );
        let body: Value = serde_json::to_value(&the_doc).expect("💀 serialize");
        assert_eq!(body["release_version"], "3.0.0");
        assert_eq!(body["release_state"], "open");
        assert_eq!(body["issues_open"], 4);
        assert_eq!(body["autocut_issues_open"], 0);
        assert_eq!(body["pulls_closed"], 2);
        assert_eq!(body["release_owners"], json!([]));
        assert_eq!(body["release_owner_exists"], false);
        assert_eq!(body["release_issue"], Value::Null);
        assert_eq!(body["release_issue_exists"], false);
        assert_eq!(
            the_doc.id,
            doc_id("release-metrics", "3.0.0", the_bucket(), "alpha")
        );
    }

    #[test]
    fn the_one_where_the_run_timestamp_is_utc_with_millis() {
        let the_moment = DateTime::parse_from_rfc3339("2024-05-01T12:34:56.789+02:00")
            .expect("💀 valid rfc3339")
            .with_timezone(&Utc);
        assert_eq!(render_run_timestamp(the_moment), "2024-05-01T10:34:56.789Z");
    }
}
