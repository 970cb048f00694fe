//! 🧠 In-memory backends: a cluster that fits in a Vec and never pages anyone.
//!
//! `InMemoryStore` plays the `DocumentSink`: it remembers which indexes exist, every bulk
//! call it saw, and every document it was handed. Knobs let tests make it slow, picky,
//! flaky, or late to the index-creation party.
//!
//! `ScriptedExecutor` plays the `QueryExecutor`: you hand it a closure from request to
//! response and it does exactly that, keeping a diary of every request along the way.
//!
//! 🔒 `Arc<tokio::sync::Mutex<...>>` all the way down, so tests can keep a clone and peek
//! after the pipeline is done with its copy. 🦆

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::backends::{
    BulkItemOutcome, BulkOutcome, CreateIndexOutcome, DocumentSink, QueryExecutor,
};
use crate::documents::BatchEntry;
use crate::index_manager::IndexSettings;
use crate::query::{SearchRequest, SearchResponse};

#[derive(Debug, Default)]
struct StoreState {
    indexes: HashSet<String>,
    created: Vec<(String, IndexSettings)>,
    bulk_calls: Vec<(String, Vec<String>)>,
    documents: HashMap<String, BTreeMap<String, String>>,
}

/// 📦 A sink that never forgets. Unlike my dad, who forgot my soccer game in 1998.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<tokio::sync::Mutex<StoreState>>,
    latency: Option<Duration>,
    rejected_ids: Arc<HashSet<String>>,
    creation_race: bool,
    broken_bulk_calls: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🐌 Every bulk call sleeps this long before doing anything.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 🙅 These ids come back as item-level 400s. Everything else is accepted.
    pub fn with_rejected_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rejected_ids = Arc::new(ids.into_iter().map(Into::into).collect());
        self
    }

    /// 🏁 `index_exists` says no, `create_index` says "already exists". Classic race.
    pub fn with_creation_race(mut self) -> Self {
        self.creation_race = true;
        self
    }

    /// 💥 The next `n` bulk calls fail outright, like the network ate them.
    pub fn with_broken_bulk_calls(self, n: usize) -> Self {
        self.broken_bulk_calls.store(n, Ordering::SeqCst);
        self
    }

    pub async fn created_indexes(&self) -> Vec<(String, IndexSettings)> {
        self.state.lock().await.created.clone()
    }

    /// 🧾 (index, ids) per bulk call, in arrival order.
    pub async fn bulk_calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().await.bulk_calls.clone()
    }

    pub async fn documents(&self, index: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .await
            .documents
            .get(index)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentSink for InMemoryStore {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.state.lock().await.indexes.contains(index))
    }

    async fn create_index(
        &self,
        index: &str,
        settings: &IndexSettings,
    ) -> Result<CreateIndexOutcome> {
        let mut state = self.state.lock().await;
        if self.creation_race || state.indexes.contains(index) {
            state.indexes.insert(index.to_string());
            return Ok(CreateIndexOutcome::AlreadyExists);
        }
        state.indexes.insert(index.to_string());
        state.created.push((index.to_string(), settings.clone()));
        Ok(CreateIndexOutcome::Created)
    }

    async fn bulk(&self, index: &str, documents: &[BatchEntry]) -> Result<BulkOutcome> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let still_broken = self
            .broken_bulk_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if still_broken {
            anyhow::bail!("💀 error sending request: the in-memory network is pretending to be down");
        }

        let mut state = self.state.lock().await;
        state.bulk_calls.push((
            index.to_string(),
            documents.iter().map(|d| d.id.clone()).collect(),
        ));
        let mut items = Vec::with_capacity(documents.len());
        for document in documents {
            if self.rejected_ids.contains(&document.id) {
                items.push(BulkItemOutcome {
                    id: document.id.clone(),
                    status: 400,
                    error: Some("mapper_parsing_exception: rejected by test".into()),
                });
                continue;
            }
            state
                .documents
                .entry(index.to_string())
                .or_default()
                .insert(document.id.clone(), document.body.clone());
            items.push(BulkItemOutcome { id: document.id.clone(), status: 201, error: None });
        }
        Ok(BulkOutcome { items })
    }
}

type Responder = dyn Fn(&SearchRequest) -> Result<SearchResponse> + Send + Sync;

/// 🎭 A query executor that reads from a script instead of a cluster.
#[derive(Clone)]
pub struct ScriptedExecutor {
    responder: Arc<Responder>,
    requests: Arc<tokio::sync::Mutex<Vec<SearchRequest>>>,
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 closures don't Debug. the diary does.
        f.debug_struct("ScriptedExecutor")
            .field("requests", &self.requests)
            .finish()
    }
}

impl ScriptedExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&SearchRequest) -> Result<SearchResponse> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            requests: Arc::default(),
        }
    }

    /// 📜 Every request it was asked, in order of arrival.
    pub async fn requests(&self) -> Vec<SearchRequest> {
        self.requests.lock().await.clone()
    }
}

/// 🧪 Parse a literal response body. For scripts.
pub fn response(body: Value) -> Result<SearchResponse> {
    Ok(serde_json::from_value(body)?)
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.requests.lock().await.push(request.clone());
        (self.responder)(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> BatchEntry {
        BatchEntry { id: id.into(), body: format!(r#"{{"id":"{id}"}}"#) }
    }

    #[tokio::test]
    async fn the_one_where_rejected_items_are_reported_not_stored() {
        let the_store = InMemoryStore::new().with_rejected_ids(["b"]);
        let outcome = the_store
            .bulk("idx", &[entry("a"), entry("b")])
            .await
            .expect("💀 item failures are not call failures");

        assert_eq!(outcome.failures().count(), 1);
        let stored = the_store.documents("idx").await;
        assert!(stored.contains_key("a"));
        assert!(!stored.contains_key("b"));
    }

    #[tokio::test]
    async fn the_one_where_the_network_comes_back_after_n_tantrums() {
        let the_store = InMemoryStore::new().with_broken_bulk_calls(1);
        assert!(the_store.bulk("idx", &[entry("a")]).await.is_err());
        assert!(the_store.bulk("idx", &[entry("a")]).await.is_ok());
        assert_eq!(the_store.bulk_calls().await.len(), 1);
    }
}
