//! 🎼 orchestrator.rs: every repository, times every metric, into one batch.
//!
//! 🎬 *[a conductor taps the stand. five hundred repositories look up. thirteen metrics
//! clear their throats. somewhere in the back, the label aggregation is still tuning.]*
//!
//! 🎯 Three phases:
//! 1. Precompute: map-valued rows that support it get one cross-repo nested terms query
//!    each, so per-repo lookups are a hash-map read instead of a round trip.
//! 2. Fan out: every (repository, row) pair that still needs a query runs, at most
//!    `query_concurrency` at a time. Rows with a derived threshold run both queries
//!    together. The first failure ends the run; outstanding queries are dropped.
//! 3. Assemble: results are sorted back into (repository, row) order and turned into
//!    documents. Label sides merge per repository. The batch is frozen on the way out.
//!
//! 🚢 Release metrics skip the row table: every (repository, release) pair fires its six
//! searches together and comes back as one document. Same fan-out cap, same fail-fast.
//!
//! 🦆 No retries. A query that fails once will fail the whole run, loudly, with context.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use tracing::{debug, info};

use crate::backends::QueryExecutor;
use crate::doc_id::DateBucket;
use crate::documents::{
    CodeCoverageDocument, DocumentBatch, DocumentBatchBuilder, LabelDocument, MetricDocument,
    ReleaseDocument, render_run_timestamp,
};
use crate::metrics::labels::LABEL_BUCKET_LIMIT;
use crate::metrics::release::{self, ReleaseInput, ReleaseQueries, ReleaseReadiness};
use crate::metrics::{
    Extracted, FamilyKind, LabelSide, MetricDefinition, REPOS_INDEX, REPOSITORY_FIELD, Threshold,
};
use crate::query::{Aggregation, Filter, SearchRequest};

const REPOS_AGG: &str = "repos";
const LABELS_AGG: &str = "labels";

/// 📏 One computed (repository, row) result. Indices, not names: sorting these back into
/// place is a tuple compare, not a string compare. Tiny win. We'll take it.
#[derive(Debug)]
struct Measurement {
    repo_idx: usize,
    def_idx: usize,
    extracted: Extracted,
    threshold: Option<i64>,
}

// -- 🗃️ repo → label → count, for one side of the ledger
type LabelLookup = HashMap<String, HashMap<String, i64>>;

/// 🎼 Owns nothing but a query executor and a sense of proportion.
///
/// Cheap to clone (one `Arc`, one small `Vec`). Holds no per-run state, so the same
/// orchestrator can assemble every family of a run, one after another.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    executor: Arc<dyn QueryExecutor>,
    /// 🚦 In-flight searches, never more. Zero gets bumped to one; we're not a screensaver.
    query_concurrency: usize,
    use_precomputed: bool,
    /// 🚢 Which releases the release family checks, per repository.
    releases: Vec<ReleaseInput>,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn QueryExecutor>, query_concurrency: usize) -> Self {
        Self {
            executor,
            query_concurrency: query_concurrency.max(1),
            use_precomputed: true,
            releases: release::tracked_releases(),
        }
    }

    /// 🚢 Swap the release watchlist. An empty list makes the release family a polite no-op.
    pub fn with_releases(mut self, releases: Vec<ReleaseInput>) -> Self {
        self.releases = releases;
        self
    }

    /// 🗃️ Turn the cross-repo label lookup off (one query per repository instead).
    /// Same documents either way; this only changes how many round trips it takes.
    pub fn with_precomputed_lookups(mut self, enabled: bool) -> Self {
        self.use_precomputed = enabled;
        self
    }

    /// 🔭 Ask the cluster which repositories it has data for. Sorted, capped at `limit`.
    ///
    /// One terms aggregation over the repo index. Whoever has the most documents makes the
    /// cut first; the sort afterwards is alphabetical so two runs agree on the order. 🦆
    pub async fn discover_repositories(&self, limit: usize) -> Result<Vec<String>> {
        let request = SearchRequest::count(REPOS_INDEX, Filter::new()).with_aggregation(
            REPOS_AGG,
            Aggregation::Terms { field: REPOSITORY_FIELD.into(), size: limit },
        );
        let response = self
            .executor
            .execute(&request)
            .await
            .context("💀 Couldn't list repositories from the cluster")?;
        let mut repositories: Vec<String> = response.terms(REPOS_AGG)?.into_keys().collect();
        repositories.sort();
        info!("🔭 Discovered {} repositories", repositories.len());
        Ok(repositories)
    }

    /// 🎯 Assemble a family's batch. Row-table families go through their catalogue;
    /// the release family goes through the watchlist instead.
    pub async fn assemble(
        &self,
        family: FamilyKind,
        repositories: &[String],
        date: NaiveDate,
        run_at: DateTime<Utc>,
    ) -> Result<DocumentBatch> {
        match family {
            FamilyKind::ReleaseMetrics => self.assemble_releases(repositories, date, run_at).await,
            _ => {
                self.assemble_definitions(family, family.definitions(), repositories, date, run_at)
                    .await
            }
        }
    }

    /// 🚢 One document per (repository, release). The cross product fans out under the
    /// same concurrency cap as everything else; each pair fires its searches together.
    pub async fn assemble_releases(
        &self,
        repositories: &[String],
        date: NaiveDate,
        run_at: DateTime<Utc>,
    ) -> Result<DocumentBatch> {
        info!(
            "🚢 Assembling {}: {} repositories × {} releases",
            FamilyKind::ReleaseMetrics,
            repositories.len(),
            self.releases.len()
        );
        let pairs: Vec<(usize, usize)> = (0..repositories.len())
            .flat_map(|repo_idx| (0..self.releases.len()).map(move |rel_idx| (repo_idx, rel_idx)))
            .collect();

        let mut checked: Vec<(usize, usize, ReleaseReadiness)> = stream::iter(pairs)
            .map(|(repo_idx, rel_idx)| {
                let repo = repositories[repo_idx].as_str();
                let release = &self.releases[rel_idx];
                async move {
                    let readiness = self.check_release(repo, release).await.with_context(|| {
                        format!(
                            "💀 Release {} for repository '{}' could not be checked",
                            release.version, repo
                        )
                    })?;
                    anyhow::Ok((repo_idx, rel_idx, readiness))
                }
            })
            .buffer_unordered(self.query_concurrency)
            .try_collect()
            .await?;
        checked.sort_by_key(|(repo_idx, rel_idx, _)| (*repo_idx, *rel_idx));

        let bucket = FamilyKind::ReleaseMetrics.id_bucket(date);
        let current_date = render_run_timestamp(run_at);
        let mut builder = DocumentBatch::builder();
        for (repo_idx, rel_idx, readiness) in checked {
            builder.insert(&ReleaseDocument::new(
                bucket,
                &current_date,
                &repositories[repo_idx],
                &self.releases[rel_idx],
                readiness,
            ))?;
        }
        let batch = builder.build();
        info!("📦 {} assembled {} documents", FamilyKind::ReleaseMetrics, batch.len());
        Ok(batch)
    }

    /// 🎯 Assemble a batch from any set of rows, filed under `family`.
    ///
    /// Public so a caller can run a hand-picked subset of a catalogue (one row, say) and get
    /// exactly the documents the full family would have produced for it, same ids and all.
    pub async fn assemble_definitions(
        &self,
        family: FamilyKind,
        definitions: &[MetricDefinition],
        repositories: &[String],
        date: NaiveDate,
        run_at: DateTime<Utc>,
    ) -> Result<DocumentBatch> {
        info!(
            "🎼 Assembling {}: {} repositories × {} metrics",
            family,
            repositories.len(),
            definitions.len()
        );

        let lookups = self.precompute(definitions, repositories).await?;

        let mut measurements = Vec::with_capacity(repositories.len() * definitions.len());
        let mut pending = Vec::new();
        for (repo_idx, repo) in repositories.iter().enumerate() {
            for (def_idx, definition) in definitions.iter().enumerate() {
                match (lookups.get(&def_idx), definition.precomputed) {
                    (Some(lookup), Some(precomputed)) => measurements.push(Measurement {
                        repo_idx,
                        def_idx,
                        extracted: Extracted::Labels {
                            side: precomputed.side,
                            counts: lookup.get(repo).cloned().unwrap_or_default(),
                        },
                        threshold: None,
                    }),
                    _ => pending.push((repo_idx, def_idx)),
                }
            }
        }

        let queried: Vec<Measurement> = stream::iter(pending)
            .map(|(repo_idx, def_idx)| {
                let repo = repositories[repo_idx].as_str();
                let definition = &definitions[def_idx];
                async move {
                    let (extracted, threshold) = self
                        .measure(definition, repo)
                        .await
                        .with_context(|| {
                            format!(
                                "💀 Metric '{}' for repository '{}' could not be computed",
                                definition.name, repo
                            )
                        })?;
                    anyhow::Ok(Measurement { repo_idx, def_idx, extracted, threshold })
                }
            })
            .buffer_unordered(self.query_concurrency)
            .try_collect()
            .await?;
        measurements.extend(queried);
        measurements.sort_by_key(|m| (m.repo_idx, m.def_idx));

        let batch = build_batch(family, definitions, repositories, date, run_at, measurements)?;
        info!("📦 {} assembled {} documents", family, batch.len());
        Ok(batch)
    }

    // -- 🚢 six searches, no dependencies between them, so they all go at once
    async fn check_release(&self, repo: &str, release: &ReleaseInput) -> Result<ReleaseReadiness> {
        let queries = ReleaseQueries::new(repo, release);
        let (issues_open, autocut_issues_open, issues_closed, pulls_open, pulls_closed, issue) = tokio::try_join!(
            self.executor.execute(&queries.issues_open),
            self.executor.execute(&queries.autocut_issues_open),
            self.executor.execute(&queries.issues_closed),
            self.executor.execute(&queries.pulls_open),
            self.executor.execute(&queries.pulls_closed),
            self.executor.execute(&queries.release_issue),
        )?;
        Ok(ReleaseReadiness {
            issues_open: issues_open.total_hits()?,
            autocut_issues_open: autocut_issues_open.total_hits()?,
            issues_closed: issues_closed.total_hits()?,
            pulls_open: pulls_open.total_hits()?,
            pulls_closed: pulls_closed.total_hits()?,
            issue: release::release_issue(&issue)?,
        })
    }

    // -- 🗃️ one nested terms query per precomputable row
    async fn precompute(
        &self,
        definitions: &[MetricDefinition],
        repositories: &[String],
    ) -> Result<HashMap<usize, LabelLookup>> {
        let mut lookups = HashMap::new();
        if !self.use_precomputed {
            return Ok(lookups);
        }
        for (def_idx, definition) in definitions.iter().enumerate() {
            let Some(precomputed) = definition.precomputed else {
                continue;
            };
            let filter = (precomputed.shared_filter)().any_of(REPOSITORY_FIELD, repositories);
            let request = SearchRequest::count(definition.search_index, filter)
                .with_aggregation(
                    REPOS_AGG,
                    Aggregation::NestedTerms {
                        outer_field: REPOSITORY_FIELD.into(),
                        outer_size: repositories.len().max(1),
                        inner_name: LABELS_AGG.into(),
                        inner_field: precomputed.label_field.into(),
                        inner_size: LABEL_BUCKET_LIMIT,
                    },
                );
            let response = self.executor.execute(&request).await.with_context(|| {
                format!("💀 The precomputed lookup for '{}' failed", definition.name)
            })?;
            let lookup = response.nested_terms(REPOS_AGG, LABELS_AGG)?;
            debug!("🗃️ '{}' precomputed for {} repositories", definition.name, lookup.len());
            lookups.insert(def_idx, lookup);
        }
        Ok(lookups)
    }

    // -- 📏 one row, one repo: primary query (+ threshold query alongside when derived).
    // -- fixed thresholds ride along for free; derived ones cost a second round trip.
    async fn measure(
        &self,
        definition: &MetricDefinition,
        repo: &str,
    ) -> Result<(Extracted, Option<i64>)> {
        let primary = definition.request_for(repo);
        match definition.threshold {
            None => {
                let response = self.executor.execute(&primary).await?;
                Ok(((definition.extract)(&response)?, None))
            }
            Some(Threshold::Fixed(threshold)) => {
                let response = self.executor.execute(&primary).await?;
                Ok(((definition.extract)(&response)?, Some(threshold)))
            }
            Some(Threshold::Derived { search_index, build_filter, derive }) => {
                let secondary = SearchRequest::count(search_index, build_filter(repo));
                let (primary_response, secondary_response) = tokio::try_join!(
                    self.executor.execute(&primary),
                    self.executor.execute(&secondary)
                )?;
                Ok((
                    (definition.extract)(&primary_response)?,
                    Some(derive(&secondary_response)?),
                ))
            }
        }
    }
}

// -- 🏷️ one document per label seen on either side, the missing side counts as zero
fn flush_labels(
    builder: &mut DocumentBatchBuilder,
    labels: &mut BTreeMap<String, (i64, i64)>,
    bucket: DateBucket,
    current_date: &str,
    repo: &str,
) -> Result<()> {
    for (label, (issues, pulls)) in std::mem::take(labels) {
        builder.insert(&LabelDocument::new(bucket, current_date, repo, &label, issues, pulls))?;
    }
    Ok(())
}

/// 📦 Turn sorted measurements into documents.
///
/// Measurements arrive sorted by (repo, row). Counts and statuses become one document each,
/// right away. Label sides pile up per repository and flush when the repository changes,
/// because a label document needs both sides and they come from different rows.
/// 🧮 The builder rejects a duplicate id, which would mean two rows share a name. Never happened. Yet.
fn build_batch(
    family: FamilyKind,
    definitions: &[MetricDefinition],
    repositories: &[String],
    date: NaiveDate,
    run_at: DateTime<Utc>,
    measurements: Vec<Measurement>,
) -> Result<DocumentBatch> {
    let bucket = family.id_bucket(date);
    let current_date = render_run_timestamp(run_at);
    let mut builder = DocumentBatch::builder();
    let mut labels: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    let mut current_repo: Option<usize> = None;

    for measurement in measurements {
        if current_repo != Some(measurement.repo_idx) {
            if let Some(previous) = current_repo {
                flush_labels(&mut builder, &mut labels, bucket, &current_date, &repositories[previous])?;
            }
            current_repo = Some(measurement.repo_idx);
        }
        let repo = &repositories[measurement.repo_idx];
        let name = definitions[measurement.def_idx].name;

        match measurement.extracted {
            Extracted::Count(count) => {
                let mut document = MetricDocument::new(family, bucket, &current_date, repo, name, count);
                if let Some(threshold) = measurement.threshold {
                    document = document.with_threshold(threshold);
                }
                builder.insert(&document)?;
            }
            Extracted::Status { count, value } => {
                let mut document = MetricDocument::new(family, bucket, &current_date, repo, name, count)
                    .with_string_value(value);
                if let Some(threshold) = measurement.threshold {
                    document = document.with_threshold(threshold);
                }
                builder.insert(&document)?;
            }
            Extracted::Coverage(snapshot) => {
                builder.insert(&CodeCoverageDocument::new(bucket, &current_date, repo, snapshot))?;
            }
            Extracted::Labels { side, counts } => {
                for (label, count) in counts {
                    let entry = labels.entry(label).or_insert((0, 0));
                    match side {
                        LabelSide::Issues => entry.0 = count,
                        LabelSide::Pulls => entry.1 = count,
                    }
                }
            }
        }
    }
    if let Some(last) = current_repo {
        flush_labels(&mut builder, &mut labels, bucket, &current_date, &repositories[last])?;
    }

    Ok(builder.build())
}
