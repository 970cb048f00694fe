//! 🔌 Backends: where the real I/O happens.
//!
//! 🔍 A `QueryExecutor` asks the cluster questions. A `DocumentSink` hands it answers to keep.
//! In production both are the same OpenSearch cluster wearing two hats. In tests they're
//! a Vec behind a Mutex pretending very hard to be a cluster.
//!
//! 🎭 Both traits are object-safe and get injected as `Arc<dyn ...>` into the orchestrator,
//! the bulk writer, and the index manager. No globals. No singletons. No "just grab the client
//! from the static". We have been to that party. The hangover lasted a quarter.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;

use crate::documents::BatchEntry;
use crate::index_manager::IndexSettings;
use crate::query::{SearchRequest, SearchResponse};

pub mod in_mem;
pub mod opensearch;

/// 🔍 Runs one search, returns the typed response.
///
/// # Contract
/// - Non-2xx from the store is an error (`PipelineError::QueryStatus`), never a silent zero.
/// - No retries. The caller decides whether a failure is fatal (spoiler: it is).
#[async_trait]
pub trait QueryExecutor: Send + Sync + Debug {
    async fn execute(&self, request: &SearchRequest) -> Result<SearchResponse>;
}

/// 🏗️ How a create-index call went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateIndexOutcome {
    Created,
    /// Someone else got there first. Benign. Happens when two runs start at once.
    AlreadyExists,
}

/// 📬 Per-document verdict from one `_bulk` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemOutcome {
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

/// 📬 What a single `_bulk` call reported back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub items: Vec<BulkItemOutcome>,
}

impl BulkOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemOutcome> {
        self.items.iter().filter(|item| !item.is_success())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// 🧾 One line per failed item. Goes straight into a `warn!`.
    pub fn failure_message(&self) -> String {
        self.failures()
            .map(|item| {
                format!(
                    "[{}]: status {} {}",
                    item.id,
                    item.status,
                    item.error.as_deref().unwrap_or("(no reason given)")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// 🚰 Where documents go to live.
///
/// # Contract
/// - `bulk` returns `Err` only for whole-call failures (transport, non-2xx).
///   Individual rejected documents are reported inside `BulkOutcome`.
/// - `create_index` maps the "already exists" race to `CreateIndexOutcome::AlreadyExists`.
#[async_trait]
pub trait DocumentSink: Send + Sync + Debug {
    async fn index_exists(&self, index: &str) -> Result<bool>;

    async fn create_index(&self, index: &str, settings: &IndexSettings)
    -> Result<CreateIndexOutcome>;

    async fn bulk(&self, index: &str, documents: &[BatchEntry]) -> Result<BulkOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_only_the_sad_items_make_the_failure_message() {
        let the_outcome = BulkOutcome {
            items: vec![
                BulkItemOutcome { id: "a".into(), status: 201, error: None },
                BulkItemOutcome {
                    id: "b".into(),
                    status: 400,
                    error: Some("mapper_parsing_exception".into()),
                },
                BulkItemOutcome { id: "c".into(), status: 500, error: None },
            ],
        };
        assert!(the_outcome.has_failures());
        assert_eq!(the_outcome.failures().count(), 2);
        assert_eq!(
            the_outcome.failure_message(),
            "[b]: status 400 mapper_parsing_exception; [c]: status 500 (no reason given)"
        );
        assert!(!BulkOutcome::default().has_failures());
    }
}
