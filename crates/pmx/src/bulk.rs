//! 🚚 bulk.rs: getting a frozen batch into an index, fast, and knowing when to give up.
//!
//! 🎯 The recipe:
//! 1. Nothing to write? Say so and leave. No index check, no calls, no drama.
//! 2. Make sure the index exists.
//! 3. Slice the batch into contiguous partitions, at most `parallelism` of them.
//! 4. Hand each partition to the worker pool. Each worker walks its slice in sub-batches
//!    of `batch_size` and fires one `_bulk` per sub-batch, no matter what the previous
//!    sub-batch said.
//! 5. Wait for everyone, but only for `timeout`. Past that, the write is a failure. Every
//!    partition shares the same deadline: a sub-batch in flight gets cut off at it, and a
//!    sub-batch that hasn't started yet never starts. Nothing lands after the clock runs out.
//!
//! ⚠️ Item rejections and failed sub-batches get logged and counted. They do not fail
//! the write. Only the clock can do that.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::app_config::RuntimeConfig;
use crate::backends::DocumentSink;
use crate::documents::DocumentBatch;
use crate::error::PipelineError;
use crate::index_manager::IndexManager;
use crate::progress::WriteProgress;
use crate::workers::WorkerPool;

/// 🎛️ Knobs for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteOptions {
    pub parallelism: usize,
    pub batch_size: usize,
    pub timeout: Duration,
}

impl Default for BulkWriteOptions {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for BulkWriteOptions {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            parallelism: runtime.bulk_parallelism,
            batch_size: runtime.bulk_batch_size,
            timeout: runtime.bulk_timeout(),
        }
    }
}

/// 🧾 How a write went. `failed` counts documents, `failed_requests` counts whole `_bulk` calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteReport {
    pub index: String,
    pub documents: usize,
    pub partitions: usize,
    pub requests: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_requests: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct PartitionReport {
    requests: usize,
    succeeded: usize,
    failed: usize,
    failed_requests: usize,
    /// ⏱️ Documents the deadline cut off. Non-zero means the write timed out.
    abandoned: usize,
}

fn timed_out(index: &str, options: &BulkWriteOptions, outstanding: usize) -> anyhow::Error {
    PipelineError::BulkWriteTimeout {
        index: index.to_string(),
        timeout: options.timeout,
        outstanding,
    }
    .into()
}

/// 🔪 Split `len` entries into contiguous, non-overlapping ranges covering everything once.
///
/// Count is `min(parallelism, ceil(len / batch_size))`, never below one for a non-empty
/// batch. Sizes differ by at most one. Empty input gives no ranges.
pub fn partition(len: usize, parallelism: usize, batch_size: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let count = parallelism
        .max(1)
        .min(len.div_ceil(batch_size.max(1)))
        .max(1);
    let base = len / count;
    let remainder = len % count;

    let mut ranges = Vec::with_capacity(count);
    let mut start = 0;
    for i in 0..count {
        let size = base + usize::from(i < remainder);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// 🚚 The write engine. Holds the sink, the index manager, and a handle on the shared pool.
#[derive(Debug, Clone)]
pub struct BulkWriter {
    sink: Arc<dyn DocumentSink>,
    index_manager: IndexManager,
    pool: Arc<WorkerPool>,
    show_progress: bool,
}

impl BulkWriter {
    pub fn new(sink: Arc<dyn DocumentSink>, index_manager: IndexManager, pool: Arc<WorkerPool>) -> Self {
        Self {
            sink,
            index_manager,
            pool,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// 🚀 Write the whole batch into `index`. See the module docs for the rules.
    pub async fn write(
        &self,
        batch: Arc<DocumentBatch>,
        index: &str,
        options: &BulkWriteOptions,
    ) -> Result<BulkWriteReport> {
        let started = Instant::now();
        if batch.is_empty() {
            info!("💤 Nothing to write into '{}'. Zero documents, zero calls.", index);
            return Ok(BulkWriteReport {
                index: index.to_string(),
                ..BulkWriteReport::default()
            });
        }

        self.index_manager.ensure_exists(index).await?;

        let ranges = partition(batch.len(), options.parallelism, options.batch_size);
        info!(
            "🚚 Writing {} documents into '{}' across {} partition(s) of ≤{} per request",
            batch.len(),
            index,
            ranges.len(),
            options.batch_size
        );

        let progress = Arc::new(WriteProgress::new(index, batch.len() as u64, self.show_progress));
        let completed = Arc::new(AtomicUsize::new(0));
        let partitions = ranges.len();
        // -- ⏱️ one clock for the whole write, shared by every partition
        let deadline = tokio::time::Instant::now() + options.timeout;

        let all_partitions = async {
            let mut receivers = Vec::with_capacity(partitions);
            for range in ranges {
                let job = write_partition(
                    self.sink.clone(),
                    batch.clone(),
                    index.to_string(),
                    range.clone(),
                    options.batch_size.max(1),
                    deadline,
                    progress.clone(),
                );
                let completed = completed.clone();
                let receiver = self
                    .pool
                    .submit(async move {
                        let report = job.await;
                        if report.abandoned == 0 {
                            completed.fetch_add(1, Ordering::SeqCst);
                        }
                        report
                    })
                    .await?;
                receivers.push((range, receiver));
            }

            let mut reports = Vec::with_capacity(partitions);
            for (range, receiver) in receivers {
                match receiver.await {
                    Ok(report) => reports.push(report),
                    Err(_) => {
                        error!(
                            "💥 Partition {:?} of '{}' died mid-write. Counting its documents as failed.",
                            range, index
                        );
                        reports.push(PartitionReport {
                            failed: range.len(),
                            ..PartitionReport::default()
                        });
                    }
                }
            }
            anyhow::Ok(reports)
        };

        let reports = match tokio::time::timeout_at(deadline, all_partitions).await {
            Ok(reports) => reports?,
            Err(_elapsed) => {
                progress.finish();
                let outstanding = partitions - completed.load(Ordering::SeqCst).min(partitions);
                return Err(timed_out(index, options, outstanding));
            }
        };
        progress.finish();

        // -- ⏱️ every partition can hit the deadline a hair before we notice it ourselves
        let outstanding = reports.iter().filter(|r| r.abandoned > 0).count();
        if outstanding > 0 {
            return Err(timed_out(index, options, outstanding));
        }

        let mut report = BulkWriteReport {
            index: index.to_string(),
            documents: batch.len(),
            partitions,
            elapsed: started.elapsed(),
            ..BulkWriteReport::default()
        };
        for partition_report in reports {
            report.requests += partition_report.requests;
            report.succeeded += partition_report.succeeded;
            report.failed += partition_report.failed;
            report.failed_requests += partition_report.failed_requests;
        }

        if report.failed > 0 {
            warn!(
                "⚠️ '{}': {} of {} documents were not indexed ({} whole request(s) failed)",
                index, report.failed, report.documents, report.failed_requests
            );
        } else {
            info!("✅ '{}': all {} documents landed in {} request(s)", index, report.succeeded, report.requests);
        }
        Ok(report)
    }
}

// -- 👷 one partition, one worker. every sub-batch gets its shot regardless of its siblings,
// -- right up until the deadline. then nobody gets a shot.
async fn write_partition(
    sink: Arc<dyn DocumentSink>,
    batch: Arc<DocumentBatch>,
    index: String,
    range: Range<usize>,
    batch_size: usize,
    deadline: tokio::time::Instant,
    progress: Arc<WriteProgress>,
) -> PartitionReport {
    let mut report = PartitionReport::default();
    let slice = &batch.entries()[range];
    for (chunk_idx, chunk) in slice.chunks(batch_size).enumerate() {
        let remaining = slice.len() - chunk_idx * batch_size;
        if tokio::time::Instant::now() >= deadline {
            report.abandoned = remaining;
            break;
        }
        report.requests += 1;
        let Ok(result) = tokio::time::timeout_at(deadline, sink.bulk(&index, chunk)).await else {
            report.abandoned = remaining;
            break;
        };
        match result {
            Ok(outcome) => {
                let failed = outcome.failures().count();
                if failed > 0 {
                    warn!(
                        "⚠️ Bulk into '{}' rejected {} of {} documents: {}",
                        index,
                        failed,
                        chunk.len(),
                        outcome.failure_message()
                    );
                }
                // -- 🧮 trust the item list, but an item the store forgot to mention didn't land either
                let succeeded = outcome.items.len().saturating_sub(failed).min(chunk.len());
                report.succeeded += succeeded;
                report.failed += chunk.len() - succeeded;
                progress.record(succeeded as u64, (chunk.len() - succeeded) as u64);
            }
            Err(err) => {
                warn!(
                    "⚠️ Bulk request of {} documents into '{}' failed outright: {:#}",
                    chunk.len(),
                    index,
                    err
                );
                report.failed_requests += 1;
                report.failed += chunk.len();
                progress.record(0, chunk.len() as u64);
            }
        }
    }
    if report.abandoned > 0 {
        warn!(
            "⏱️ Deadline hit in '{}': {} document(s) of this partition were never written",
            index, report.abandoned
        );
        progress.record(0, report.abandoned as u64);
    } else {
        debug!(
            "🏁 Partition done for '{}': {} request(s), {} ok, {} failed",
            index, report.requests, report.succeeded, report.failed
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemoryStore;
    use crate::documents::{DocumentBatchBuilder, LabelDocument};
    use crate::doc_id::DateBucket;
    use crate::index_manager::IndexSettings;
    use chrono::NaiveDate;
    use std::collections::HashSet;

    fn the_batch(n: usize) -> Arc<DocumentBatch> {
        let the_day = DateBucket::Day(NaiveDate::from_ymd_opt(2024, 1, 2).expect("💀 date"));
        let mut builder = DocumentBatchBuilder::default();
        for i in 0..n {
            builder
                .insert(&LabelDocument::new(the_day, "t", "alpha", &format!("label-{i}"), 0, 0))
                .expect("💀 insert");
        }
        Arc::new(builder.build())
    }

    fn the_writer(store: &InMemoryStore, pool_size: usize) -> BulkWriter {
        let sink: Arc<dyn DocumentSink> = Arc::new(store.clone());
        BulkWriter::new(
            sink.clone(),
            IndexManager::new(sink, IndexSettings::default()),
            Arc::new(WorkerPool::new(pool_size)),
        )
    }

    fn options(parallelism: usize, batch_size: usize) -> BulkWriteOptions {
        BulkWriteOptions { parallelism, batch_size, timeout: Duration::from_secs(5) }
    }

    #[test]
    fn the_one_where_partitions_cover_everything_exactly_once() {
        for (len, parallelism, batch_size) in
            [(1, 8, 200), (7, 8, 200), (1000, 8, 200), (1001, 8, 200), (1600, 8, 200), (5, 3, 1), (10, 1, 3)]
        {
            let ranges = partition(len, parallelism, batch_size);
            let expected = parallelism.min(len.div_ceil(batch_size)).max(1);
            assert_eq!(ranges.len(), expected, "len={len} p={parallelism} b={batch_size}");

            let mut seen = HashSet::new();
            for range in &ranges {
                assert!(!range.is_empty());
                for i in range.clone() {
                    assert!(seen.insert(i), "index {i} landed in two partitions");
                }
            }
            assert_eq!(seen.len(), len);
            let sizes: Vec<_> = ranges.iter().map(|r| r.len()).collect();
            let (min, max) = (sizes.iter().min(), sizes.iter().max());
            assert!(max.zip(min).is_some_and(|(max, min)| max - min <= 1));
        }
        assert!(partition(0, 8, 200).is_empty());
    }

    #[tokio::test]
    async fn the_one_where_an_empty_batch_makes_zero_calls() {
        let the_store = InMemoryStore::new();
        let report = the_writer(&the_store, 2)
            .write(Arc::new(DocumentBatch::default()), "idx", &options(8, 200))
            .await
            .expect("💀 empty writes succeed");

        assert_eq!(report.requests, 0);
        assert!(the_store.bulk_calls().await.is_empty());
        assert!(the_store.created_indexes().await.is_empty());
    }

    #[tokio::test]
    async fn the_one_where_every_document_lands_in_right_sized_requests() {
        let the_store = InMemoryStore::new();
        let the_batch = the_batch(45);
        let report = the_writer(&the_store, 3)
            .write(the_batch.clone(), "opensearch_label_metrics", &options(4, 10))
            .await
            .expect("💀 write");

        assert_eq!(report.partitions, 4);
        assert_eq!(report.succeeded, 45);
        assert_eq!(report.failed, 0);
        let calls = the_store.bulk_calls().await;
        assert!(calls.iter().all(|(index, ids)| index == "opensearch_label_metrics" && ids.len() <= 10));
        let stored = the_store.documents("opensearch_label_metrics").await;
        assert_eq!(stored.len(), 45);
        assert!(the_batch.ids().all(|id| stored.contains_key(id)));
        assert_eq!(the_store.created_indexes().await.len(), 1);
    }

    #[tokio::test]
    async fn the_one_where_rejected_items_and_dead_requests_do_not_fail_the_write() {
        let the_batch = the_batch(6);
        let the_victim = the_batch.entries()[0].id.clone();
        let the_store = InMemoryStore::new()
            .with_rejected_ids([the_victim])
            .with_broken_bulk_calls(1);

        let report = the_writer(&the_store, 1)
            .write(the_batch, "idx", &options(1, 2))
            .await
            .expect("💀 partial failure is still Ok");

        assert_eq!(report.requests, 3);
        assert_eq!(report.failed_requests, 1);
        // -- first call dies entirely (2 docs), the victim was in that call, so the rest land
        assert_eq!(report.failed, 2);
        assert_eq!(report.succeeded, 4);
        assert_eq!(the_store.bulk_calls().await.len(), 2);
    }

    #[tokio::test]
    async fn the_one_where_the_clock_runs_out_and_that_is_fatal() {
        let the_store = InMemoryStore::new().with_latency(Duration::from_millis(500));
        let the_options = BulkWriteOptions {
            parallelism: 2,
            batch_size: 1,
            timeout: Duration::from_millis(50),
        };

        let err = the_writer(&the_store, 2)
            .write(the_batch(4), "idx", &the_options)
            .await
            .expect_err("💀 a slow sink past the deadline must fail the write");
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::BulkWriteTimeout { index, outstanding, .. }) => {
                assert_eq!(index, "idx");
                assert_eq!(*outstanding, 2);
            }
            honestly_who_knows => panic!("💀 expected a timeout, got {honestly_who_knows:?}"),
        }
    }

    #[tokio::test]
    async fn the_one_where_the_deadline_stops_the_queue_not_just_the_waiting() {
        let the_store = InMemoryStore::new().with_latency(Duration::from_millis(500));
        let sink: Arc<dyn DocumentSink> = Arc::new(the_store.clone());
        let the_pool = Arc::new(WorkerPool::new(1));
        let the_writer = BulkWriter::new(
            sink.clone(),
            IndexManager::new(sink, IndexSettings::default()),
            the_pool.clone(),
        );
        let the_options = BulkWriteOptions {
            parallelism: 1,
            batch_size: 1,
            timeout: Duration::from_millis(50),
        };

        let err = the_writer
            .write(the_batch(6), "idx", &the_options)
            .await
            .expect_err("💀 six slow sub-batches can't fit in 50ms");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::BulkWriteTimeout { outstanding: 1, .. })
        ));

        // -- 🗑️ draining the crew must not replay the five sub-batches still queued
        drop(the_writer);
        let the_pool = Arc::try_unwrap(the_pool).expect("💀 the writer was the only other owner");
        let drained_at = Instant::now();
        the_pool.shutdown().await.expect("💀 clean shutdown");
        assert!(drained_at.elapsed() < Duration::from_millis(400));
        assert!(the_store.bulk_calls().await.is_empty());
    }

    #[test]
    fn the_one_where_options_follow_the_runtime_config() {
        let the_options = BulkWriteOptions::default();
        assert_eq!(the_options.parallelism, 8);
        assert_eq!(the_options.batch_size, 200);
        assert_eq!(the_options.timeout, Duration::from_secs(600));
    }
}
