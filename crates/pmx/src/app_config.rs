//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::backends::opensearch::OpenSearchConfig;
use crate::index_manager::IndexSettings;
use crate::metrics::FamilyKind;
use crate::metrics::release::{self, ReleaseInput};

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 📡 Where the metrics get read from and written to. Same cluster, both directions.
    #[serde(alias = "opensearch")]
    pub store: OpenSearchConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub index_settings: IndexSettings,
    #[serde(default)]
    pub run: RunConfig,
}

/// 🧵 How hard we lean on the cluster. Defaults are the numbers the old cron job lived with.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 👷 Long-lived bulk workers, spun up once per process.
    #[serde(default = "default_worker_pool_size", alias = "num_threads")]
    pub worker_pool_size: usize,
    /// 🔪 How many partitions a batch gets sliced into (upper bound).
    #[serde(default = "default_bulk_parallelism")]
    pub bulk_parallelism: usize,
    /// 📦 Documents per `_bulk` call.
    #[serde(default = "default_bulk_batch_size", alias = "os_bulk_size")]
    pub bulk_batch_size: usize,
    /// ⏱️ The whole write gets this long. Then it's a fatal error.
    #[serde(default = "default_bulk_timeout_secs", alias = "index_thread_timeout_secs")]
    pub bulk_timeout_secs: u64,
    /// 🔍 In-flight searches at once during fan-out.
    #[serde(default = "default_query_concurrency")]
    pub query_concurrency: usize,
    /// 📊 Progress bar on or off. Off in CI unless you enjoy escape codes in your logs.
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_bulk_parallelism() -> usize {
    8
}

fn default_bulk_batch_size() -> usize {
    200
}

// -- ⏱️ ten minutes. if the bulk isn't done by then, it isn't getting done.
fn default_bulk_timeout_secs() -> u64 {
    600
}

fn default_query_concurrency() -> usize {
    4
}

fn default_show_progress() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            bulk_parallelism: default_bulk_parallelism(),
            bulk_batch_size: default_bulk_batch_size(),
            bulk_timeout_secs: default_bulk_timeout_secs(),
            query_concurrency: default_query_concurrency(),
            show_progress: default_show_progress(),
        }
    }
}

impl RuntimeConfig {
    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_timeout_secs)
    }
}

/// 🎯 What to measure this run.
#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    /// 📊 Which metric families run, in order.
    #[serde(default = "default_families")]
    pub families: Vec<FamilyKind>,
    /// 📚 Repositories to measure. Empty means "ask the cluster which ones exist".
    #[serde(default)]
    pub repositories: Vec<String>,
    /// 🔢 Cap on discovered repositories.
    #[serde(default = "default_repository_discovery_limit")]
    pub repository_discovery_limit: usize,
    /// 🚢 Releases the release family keeps an eye on. `[[run.releases]]`, one table each.
    #[serde(default = "release::tracked_releases")]
    pub releases: Vec<ReleaseInput>,
}

fn default_families() -> Vec<FamilyKind> {
    FamilyKind::ALL.to_vec()
}

fn default_repository_discovery_limit() -> usize {
    500
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            families: default_families(),
            repositories: Vec::new(),
            repository_discovery_limit: default_repository_discovery_limit(),
            releases: release::tracked_releases(),
        }
    }
}

/// 🚀 Load the config, from a file, from env vars, or from the sheer power of hoping.
///
/// 🔧 Merges environment variables (PMX_*, `__` for nesting: `PMX_STORE__URL`) with an
/// optional TOML file. TOML wins on conflicts. No file means env vars only. No pizza defaults.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("PMX_").split("__"));

    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (PMX_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (PMX_*). \
                 No file was provided, this one's all on the environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_test_config(contents: &str) -> NamedTempFile {
        // 🧪 We write a real file here because Figment wants TOML from disk, like it's method acting.
        let mut the_file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("💀 Failed to create a temp file. The filesystem said 'new phone who dis'.");
        the_file
            .write_all(contents.as_bytes())
            .expect("💀 Failed to write test config. The disk is having a moment.");
        the_file
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() {
        let the_file = write_test_config(
            r#"
            [store]
            url = "http://localhost:9200"
            "#,
        );

        let app_config = load_config(Some(the_file.path()))
            .expect("💀 A bare store section should be enough. Serde left us on read otherwise.");

        assert_eq!(app_config.store.url, "http://localhost:9200");
        assert_eq!(app_config.runtime.worker_pool_size, 8);
        assert_eq!(app_config.runtime.bulk_parallelism, 8);
        assert_eq!(app_config.runtime.bulk_batch_size, 200);
        assert_eq!(app_config.runtime.bulk_timeout(), Duration::from_secs(600));
        assert_eq!(app_config.index_settings.number_of_replicas, 2);
        assert_eq!(app_config.index_settings.total_fields_limit, 8000);
        assert_eq!(app_config.run.families, FamilyKind::ALL.to_vec());
        assert!(app_config.run.repositories.is_empty());
        assert_eq!(app_config.run.repository_discovery_limit, 500);
        assert_eq!(app_config.run.releases, release::tracked_releases());
    }

    #[test]
    fn the_one_where_the_release_watchlist_comes_from_the_file() {
        let the_file = write_test_config(
            r#"
            [store]
            url = "http://localhost:9200"

            [[run.releases]]
            version = "2.19.0"

            [[run.releases]]
            version = "2.18.0"
            state = "closed"
            "#,
        );

        let app_config = load_config(Some(the_file.path()))
            .expect("💀 Release tables should parse. They're just version numbers with ambitions.");

        assert_eq!(
            app_config.run.releases,
            vec![ReleaseInput::new("2.19.0", "open"), ReleaseInput::new("2.18.0", "closed")]
        );
    }

    #[test]
    fn the_one_where_runtime_accepts_its_former_stage_names() {
        let the_file = write_test_config(
            r#"
            [opensearch]
            url = "http://search:9200"
            api_key = "c2VjcmV0"

            [runtime]
            num_threads = 3
            os_bulk_size = 50
            index_thread_timeout_secs = 5

            [run]
            families = ["general-metrics", "label-metrics"]
            repositories = ["alpha", "beta"]
            "#,
        );

        let app_config = load_config(Some(the_file.path()))
            .expect("💀 Runtime aliases should parse. The witness protection paperwork was valid.");

        assert_eq!(app_config.store.api_key.as_deref(), Some("c2VjcmV0"));
        assert_eq!(app_config.runtime.worker_pool_size, 3);
        assert_eq!(app_config.runtime.bulk_batch_size, 50);
        assert_eq!(app_config.runtime.bulk_timeout_secs, 5);
        assert_eq!(
            app_config.run.families,
            vec![FamilyKind::GeneralMetrics, FamilyKind::LabelMetrics]
        );
        assert_eq!(app_config.run.repositories, vec!["alpha", "beta"]);
    }

    #[test]
    fn the_one_where_an_unknown_family_is_refused_at_the_door() {
        let the_file = write_test_config(
            r#"
            [store]
            url = "http://localhost:9200"

            [run]
            families = ["vibes-metrics"]
            "#,
        );

        assert!(load_config(Some(the_file.path())).is_err());
    }

    #[test]
    fn the_one_where_the_toml_crate_agrees_with_figment_about_index_settings() {
        let the_settings: IndexSettings = toml::from_str(
            r#"
            number_of_replicas = 0
            nested_objects_limit = 10
            "#,
        )
        .expect("💀 partial index settings should fill in the rest");
        assert_eq!(the_settings.number_of_replicas, 0);
        assert_eq!(the_settings.nested_objects_limit, 10);
        assert_eq!(the_settings.depth_limit, 300);
    }
}
