//! 🏗️ index_manager.rs: making sure there's somewhere to put things before putting things.
//!
//! HEAD the index. Missing? PUT it with the capacity settings. Someone else PUT it a
//! millisecond before us? Fine. That's the same outcome with extra steps. We never delete.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::backends::{CreateIndexOutcome, DocumentSink};

/// 📐 Capacity settings for freshly created metric indexes.
///
/// Metric docs are small, but the label family fans out into a lot of distinct field
/// values over time, so the mapping limits are generous.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct IndexSettings {
    #[serde(default = "default_number_of_replicas")]
    pub number_of_replicas: u32,
    #[serde(default = "default_total_fields_limit")]
    pub total_fields_limit: u32,
    #[serde(default = "default_depth_limit")]
    pub depth_limit: u32,
    #[serde(default = "default_nested_fields_limit")]
    pub nested_fields_limit: u32,
    #[serde(default = "default_nested_objects_limit")]
    pub nested_objects_limit: u32,
}

fn default_number_of_replicas() -> u32 {
    2
}

fn default_total_fields_limit() -> u32 {
    8000
}

fn default_depth_limit() -> u32 {
    300
}

fn default_nested_fields_limit() -> u32 {
    800
}

fn default_nested_objects_limit() -> u32 {
    8000
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_replicas: default_number_of_replicas(),
            total_fields_limit: default_total_fields_limit(),
            depth_limit: default_depth_limit(),
            nested_fields_limit: default_nested_fields_limit(),
            nested_objects_limit: default_nested_objects_limit(),
        }
    }
}

impl IndexSettings {
    /// 📦 The `{"settings": {...}}` body for `PUT /{index}`.
    pub fn to_body(&self) -> Value {
        json!({
            "settings": {
                "index.number_of_replicas": self.number_of_replicas,
                "index.mapping.total_fields.limit": self.total_fields_limit,
                "index.mapping.depth.limit": self.depth_limit,
                "index.mapping.nested_fields.limit": self.nested_fields_limit,
                "index.mapping.nested_objects.limit": self.nested_objects_limit
            }
        })
    }
}

/// 🏗️ Creates indexes lazily, exactly as often as needed (which is almost never).
#[derive(Debug, Clone)]
pub struct IndexManager {
    sink: Arc<dyn DocumentSink>,
    settings: IndexSettings,
}

impl IndexManager {
    pub fn new(sink: Arc<dyn DocumentSink>, settings: IndexSettings) -> Self {
        Self { sink, settings }
    }

    /// ✅ After this returns `Ok`, the index exists. How it came to exist is not our business.
    pub async fn ensure_exists(&self, index: &str) -> Result<()> {
        let exists = self
            .sink
            .index_exists(index)
            .await
            .with_context(|| format!("💀 Couldn't even ask whether index '{index}' exists"))?;
        if exists {
            debug!("✅ Index '{}' already exists, welcome mat is out", index);
            return Ok(());
        }

        match self
            .sink
            .create_index(index, &self.settings)
            .await
            .with_context(|| format!("💀 Tried to create index '{index}'. The cluster declined."))?
        {
            CreateIndexOutcome::Created => {
                info!("🏗️ Created index '{}'", index);
            }
            CreateIndexOutcome::AlreadyExists => {
                debug!("🏁 Index '{}' was created by someone else in the meantime. Same result.", index);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::in_mem::InMemoryStore;

    #[tokio::test]
    async fn the_one_where_a_missing_index_gets_built_with_the_fixed_settings() {
        let the_store = InMemoryStore::new();
        let the_manager = IndexManager::new(Arc::new(the_store.clone()), IndexSettings::default());

        the_manager.ensure_exists("opensearch_general_metrics").await.expect("💀 create");
        the_manager.ensure_exists("opensearch_general_metrics").await.expect("💀 second call");

        let created = the_store.created_indexes().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "opensearch_general_metrics");
        assert_eq!(created[0].1, IndexSettings::default());
    }

    #[tokio::test]
    async fn the_one_where_losing_the_creation_race_is_not_an_error() {
        let the_store = InMemoryStore::new().with_creation_race();
        let the_manager = IndexManager::new(Arc::new(the_store.clone()), IndexSettings::default());

        the_manager
            .ensure_exists("opensearch_label_metrics")
            .await
            .expect("💀 'already exists' should be swallowed");
        assert!(the_store.created_indexes().await.is_empty());
    }

    #[test]
    fn the_one_where_the_settings_body_has_every_limit() {
        let body = IndexSettings::default().to_body();
        assert_eq!(body["settings"]["index.number_of_replicas"], 2);
        assert_eq!(body["settings"]["index.mapping.total_fields.limit"], 8000);
        assert_eq!(body["settings"]["index.mapping.depth.limit"], 300);
        assert_eq!(body["settings"]["index.mapping.nested_fields.limit"], 800);
        assert_eq!(body["settings"]["index.mapping.nested_objects.limit"], 8000);
    }
}
