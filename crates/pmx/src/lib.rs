//! 📊 pmx: project-health metrics, measured across every repository, written in bulk.
//!
//! 🎬 *[a cron job wakes up. it has one job. well, five families of jobs.]*
//!
//! Per family: the orchestrator fans repositories × metric rows (or × tracked releases) out into queries,
//! assembles one frozen `DocumentBatch` with deterministic ids, and the bulk writer
//! pushes it into the family's index through a shared worker pool. Reruns overwrite.
//! Nothing is retried. Anything fatal comes back as an `anyhow::Error` with a
//! `PipelineError` somewhere in the chain for callers who care which kind. 🦆

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;

pub mod app_config;
pub mod backends;
pub mod bulk;
pub mod doc_id;
pub mod documents;
pub mod error;
pub mod index_manager;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod query;
pub mod workers;

use crate::app_config::AppConfig;
use crate::backends::opensearch::OpenSearchStore;
use crate::backends::{DocumentSink, QueryExecutor};
use crate::bulk::{BulkWriteOptions, BulkWriter};
use crate::index_manager::IndexManager;
use crate::metrics::FamilyKind;
use crate::orchestrator::Orchestrator;
use crate::progress::FamilyRunReport;
use crate::workers::WorkerPool;

/// 🎯 Per-invocation overrides. `None` falls back to the `[run]` config table.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 📅 The date bucket being measured. Backfills pass an older one.
    pub date: NaiveDate,
    pub families: Option<Vec<FamilyKind>>,
    pub repositories: Option<Vec<String>>,
}

/// 🚰 Orchestrator on one end, bulk writer on the other. Backend-agnostic.
#[derive(Debug, Clone)]
pub struct Pipeline {
    orchestrator: Orchestrator,
    writer: BulkWriter,
    write_options: BulkWriteOptions,
    discovery_limit: usize,
}

impl Pipeline {
    pub fn new(orchestrator: Orchestrator, writer: BulkWriter, write_options: BulkWriteOptions) -> Self {
        Self {
            orchestrator,
            writer,
            write_options,
            discovery_limit: app_config::RunConfig::default().repository_discovery_limit,
        }
    }

    /// 🏗️ Wire everything from config around an executor, a sink, and the shared pool.
    pub fn from_parts(
        app_config: &AppConfig,
        executor: Arc<dyn QueryExecutor>,
        sink: Arc<dyn DocumentSink>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        let runtime = &app_config.runtime;
        let index_manager = IndexManager::new(sink.clone(), app_config.index_settings.clone());
        let show_progress = runtime.show_progress && std::io::stderr().is_terminal();
        Self {
            orchestrator: Orchestrator::new(executor, runtime.query_concurrency)
                .with_releases(app_config.run.releases.clone()),
            writer: BulkWriter::new(sink, index_manager, pool).with_progress(show_progress),
            write_options: BulkWriteOptions::from(runtime),
            discovery_limit: app_config.run.repository_discovery_limit,
        }
    }

    /// 📊 One family: assemble, then write into the family's index for `date`.
    pub async fn run_family(
        &self,
        family: FamilyKind,
        repositories: &[String],
        date: NaiveDate,
        run_at: DateTime<Utc>,
    ) -> Result<FamilyRunReport> {
        let batch = self
            .orchestrator
            .assemble(family, repositories, date, run_at)
            .await
            .with_context(|| format!("💀 Assembling the {} batch went sideways", family))?;
        let index = family.index_name(date);
        let write = self
            .writer
            .write(Arc::new(batch), &index, &self.write_options)
            .await
            .with_context(|| format!("💀 Writing the {} batch into '{}' went sideways", family, index))?;
        info!(
            "✅ {} done: {} written, {} failed, into '{}'",
            family, write.succeeded, write.failed, index
        );
        Ok(FamilyRunReport {
            family,
            repositories: repositories.len(),
            write,
        })
    }

    /// 🚀 Every requested family, in order. No repositories means discover them first.
    /// The first fatal error stops the run; families already written stay written.
    pub async fn run(
        &self,
        families: &[FamilyKind],
        repositories: &[String],
        date: NaiveDate,
        run_at: DateTime<Utc>,
    ) -> Result<Vec<FamilyRunReport>> {
        let discovered;
        let repositories = if repositories.is_empty() {
            discovered = self
                .orchestrator
                .discover_repositories(self.discovery_limit)
                .await?;
            discovered.as_slice()
        } else {
            repositories
        };

        let mut reports = Vec::with_capacity(families.len());
        for &family in families {
            reports.push(self.run_family(family, repositories, date, run_at).await?);
        }
        Ok(reports)
    }
}

/// 🚀 The whole show against a real cluster: build the store, hire the crew, run, clean up.
pub async fn run(app_config: AppConfig, options: RunOptions) -> Result<Vec<FamilyRunReport>> {
    let store = Arc::new(
        OpenSearchStore::new(app_config.store.clone())
            .context("💀 Couldn't build the store client. Check [store] in the config.")?,
    );
    let pool = Arc::new(WorkerPool::new(app_config.runtime.worker_pool_size));
    let pipeline = Pipeline::from_parts(&app_config, store.clone(), store, pool.clone());

    let families = options
        .families
        .unwrap_or_else(|| app_config.run.families.clone());
    let repositories = options
        .repositories
        .unwrap_or_else(|| app_config.run.repositories.clone());
    info!(
        "🚀 pmx run for {}: {} families, {} repositories{}",
        options.date,
        families.len(),
        repositories.len(),
        if repositories.is_empty() { " (discovering)" } else { "" }
    );

    let result = pipeline
        .run(&families, &repositories, options.date, Utc::now())
        .await;

    // -- 🗑️ the pipeline holds the other handle; drop it so the pool is ours alone.
    // -- a failed run doesn't wait on the crew: whatever they're holding is already late.
    drop(pipeline);
    match Arc::try_unwrap(pool) {
        Ok(pool) if result.is_err() => pool.abort(),
        Ok(pool) => pool.shutdown().await?,
        Err(_) => tracing::warn!("⚠️ Worker pool still shared at shutdown. Leaving it to the runtime."),
    }
    result
}

