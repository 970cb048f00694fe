//! # 📡 THE OPENSEARCH BACKEND
//!
//! 🎬 COLD OPEN. INT. SERVER ROOM, 3:47 AM
//!
//! The cron job fires. Five hundred repositories. Thirteen metrics each. One cluster,
//! asked the same kind of question six thousand times, answering each one with a
//! polite little JSON object. Then we hand it the answers back, two hundred at a time.
//!
//! 🚀 This module is both halves of that conversation: `_search` going out, `_bulk` coming
//! home, and the occasional HEAD/PUT to make sure home exists.
//!
//! ⚠️ No retries live here. Errors leave with context attached and go upstairs.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::backends::{
    BulkItemOutcome, BulkOutcome, CreateIndexOutcome, DocumentSink, QueryExecutor,
};
use crate::documents::BatchEntry;
use crate::error::PipelineError;
use crate::index_manager::IndexSettings;
use crate::query::{SearchRequest, SearchResponse};

const ALREADY_EXISTS: &str = "resource_already_exists_exception";

// 📡 OpenSearchConfig, "It's just OpenSearch", she said, before the cluster went yellow.
//
// 🔧 auth is tri-modal: username+password, api_key, or "I hope anonymous works" (it might,
// on your laptop).
#[derive(Debug, Deserialize, Clone)]
pub struct OpenSearchConfig {
    /// 📡 The URL of your cluster. Include scheme + port. Yes, all of it.
    pub url: String,
    /// 🔒 Username for basic auth. Optional, like flossing.
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 Password. "password123" is not a password. It is a confession.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key auth, the velvet rope variant. Beats basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 🫁 Gzip `_bulk` bodies. Worth it when the cluster is far away.
    #[serde(default)]
    pub compress_requests: bool,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl OpenSearchConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            compress_requests: false,
        }
    }
}

/// 📦 One HTTP client, reused for every search and every bulk. Both traits, one struct.
#[derive(Debug, Clone)]
pub struct OpenSearchStore {
    // 📡 reqwest::Client, reused because spinning up a new client per request is the
    // networking equivalent of buying a new car every time you need groceries.
    client: reqwest::Client,
    config: OpenSearchConfig,
}

// -- 📬 the bits of a `_bulk` response we care about
#[derive(Debug, Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, RawBulkItem>>,
}

#[derive(Debug, Deserialize)]
struct RawBulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

fn describe_item_error(error: &Value) -> String {
    match (
        error.get("type").and_then(Value::as_str),
        error.get("reason").and_then(Value::as_str),
    ) {
        (Some(kind), Some(reason)) => format!("{kind}: {reason}"),
        (Some(kind), None) => kind.to_string(),
        _ => error.to_string(),
    }
}

impl OpenSearchStore {
    /// 🚀 Build the client with the configured timeouts. No network traffic yet.
    pub fn new(config: OpenSearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. The TLS stack wept. Probably a missing cert or a cursed system OpenSSL.")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    // 🔒 API key wins over basic auth. This is not a democracy.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    /// 📦 Two NDJSON lines per document: the action, then the body as-is.
    fn transform_into_bulk(index: &str, documents: &[BatchEntry]) -> String {
        let estimated_size: usize = documents.iter().map(|d| d.body.len() + 100).sum();
        let mut bulk_body = String::with_capacity(estimated_size);
        for document in documents {
            let action = json!({ "index": { "_index": index, "_id": document.id } });
            bulk_body.push_str(&action.to_string());
            bulk_body.push('\n');
            bulk_body.push_str(&document.body);
            bulk_body.push('\n');
        }
        bulk_body
    }

    fn gzip(body: &str) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(body.as_bytes())
            .context("💀 gzip choked on the bulk body")?;
        encoder.finish().context("💀 gzip couldn't finish. Bytes remain unsquished.")
    }
}

#[async_trait]
impl QueryExecutor for OpenSearchStore {
    async fn execute(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let search_url = self.url(&format!("{}/_search", request.index));
        trace!("🔍 POST {} {}", search_url, request.to_body());
        let response = self
            .authorize(self.client.post(&search_url))
            .json(&request.to_body())
            .send()
            .await
            .with_context(|| format!("💀 The search on '{}' never made it to the cluster", request.index))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::QueryStatus {
                index: request.index.clone(),
                status: status.as_u16(),
                body,
            }
            .into());
        }

        response
            .json::<SearchResponse>()
            .await
            .with_context(|| format!("💀 The search on '{}' answered in something that isn't a search response", request.index))
    }
}

#[async_trait]
impl DocumentSink for OpenSearchStore {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        let response = self
            .authorize(self.client.head(self.url(index)))
            .send()
            .await
            .context("💀 Reached out to check if the index exists. Got ghosted.")?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => anyhow::bail!(
                "💀 Asked whether '{}' exists and got '{}'. That's not a yes and it's not a no.",
                index,
                status
            ),
        }
    }

    async fn create_index(
        &self,
        index: &str,
        settings: &IndexSettings,
    ) -> Result<CreateIndexOutcome> {
        let response = self
            .authorize(self.client.put(self.url(index)))
            .json(&settings.to_body())
            .send()
            .await
            .with_context(|| format!("💀 The create request for '{index}' never arrived"))?;

        let status = response.status();
        if status.is_success() {
            return Ok(CreateIndexOutcome::Created);
        }
        let body = response.text().await.unwrap_or_default();
        if body.contains(ALREADY_EXISTS) {
            return Ok(CreateIndexOutcome::AlreadyExists);
        }
        anyhow::bail!(
            "💀 Creating index '{}' came back '{}': {}",
            index,
            status,
            body
        )
    }

    async fn bulk(&self, index: &str, documents: &[BatchEntry]) -> Result<BulkOutcome> {
        let bulk_body = Self::transform_into_bulk(index, documents);
        let request = self
            .authorize(self.client.post(self.url("_bulk")))
            // ⚠️ application/x-ndjson, not application/json. The cluster notices.
            .header("Content-Type", "application/x-ndjson");
        let request = if self.config.compress_requests {
            request
                .header("Content-Encoding", "gzip")
                .body(Self::gzip(&bulk_body)?)
        } else {
            request.body(bulk_body)
        };

        let response = request
            .send()
            .await
            .context("💀 The bulk request never made it to the cluster. The network is not vibing with it.")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "💀 The bulk request arrived, but the cluster said '{}'. The body read: '{}'.",
                status,
                body
            );
        }

        let raw: RawBulkResponse = response
            .json()
            .await
            .context("💀 The bulk response wasn't the JSON we were promised")?;
        let items = raw
            .items
            .into_iter()
            .filter_map(|mut item| item.drain().next().map(|(_, outcome)| outcome))
            .map(|item| BulkItemOutcome {
                id: item.id.unwrap_or_default(),
                status: item.status,
                error: item.error.as_ref().map(describe_item_error),
            })
            .collect();
        debug!("📡 Yeeted {} documents into '{}'", documents.len(), index);
        Ok(BulkOutcome { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn the_store(server: &MockServer) -> OpenSearchStore {
        OpenSearchStore::new(OpenSearchConfig::new(server.uri())).expect("💀 client should build")
    }

    fn entry(id: &str) -> BatchEntry {
        BatchEntry { id: id.into(), body: format!(r#"{{"metric_count":0,"id":"{id}"}}"#) }
    }

    #[tokio::test]
    async fn the_one_where_a_search_comes_back_typed() {
        let server = MockServer::start().await;
        let the_request = SearchRequest::count("github_issues", Filter::new().matching("state.keyword", "open"));
        Mock::given(method("POST"))
            .and(path("/github_issues/_search"))
            .and(body_json(the_request.to_body()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": { "total": { "value": 12, "relation": "eq" }, "hits": [] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = the_store(&server).execute(&the_request).await.expect("💀 search");
        assert_eq!(response.total_hits().expect("total"), 12);
    }

    #[tokio::test]
    async fn the_one_where_a_non_ok_search_is_a_query_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/github_pulls/_search"))
            .respond_with(ResponseTemplate::new(503).set_body_string("cluster is napping"))
            .mount(&server)
            .await;

        let err = the_store(&server)
            .execute(&SearchRequest::count("github_pulls", Filter::new()))
            .await
            .expect_err("💀 a 503 is not a zero");
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::QueryStatus { status, body, .. }) => {
                assert_eq!(*status, 503);
                assert_eq!(body, "cluster is napping");
            }
            honestly_who_knows => panic!("💀 expected QueryStatus, got {honestly_who_knows:?}"),
        }
    }

    #[tokio::test]
    async fn the_one_where_the_bulk_body_is_ndjson_and_items_are_parsed() {
        let server = MockServer::start().await;
        let mut config = OpenSearchConfig::new(server.uri());
        config.api_key = Some("c2VjcmV0".into());
        config.username = Some("ignored".into());
        let the_store = OpenSearchStore::new(config).expect("💀 client");

        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(header("Authorization", "ApiKey c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "took": 3,
                "errors": true,
                "items": [
                    { "index": { "_id": "a", "status": 201 } },
                    { "index": { "_id": "b", "status": 400,
                                 "error": { "type": "mapper_parsing_exception", "reason": "nope" } } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = the_store
            .bulk("opensearch_general_metrics", &[entry("a"), entry("b")])
            .await
            .expect("💀 item errors are not call errors");
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.failure_message(), "[b]: status 400 mapper_parsing_exception: nope");

        let received = server.received_requests().await.expect("💀 recording is on");
        let sent = String::from_utf8(received[0].body.clone()).expect("💀 utf8");
        let lines: Vec<&str> = sent.lines().collect();
        assert_eq!(lines.len(), 4);
        let action: Value = serde_json::from_str(lines[0]).expect("💀 action line");
        assert_eq!(action, json!({ "index": { "_index": "opensearch_general_metrics", "_id": "a" } }));
        assert_eq!(lines[1], entry("a").body);
    }

    #[tokio::test]
    async fn the_one_where_the_index_dance_handles_404_and_the_race() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/opensearch_label_metrics"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/opensearch_label_metrics"))
            .and(body_json(IndexSettings::default().to_body()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "type": "resource_already_exists_exception", "reason": "index exists" },
                "status": 400
            })))
            .mount(&server)
            .await;

        let the_store = the_store(&server);
        assert!(!the_store.index_exists("opensearch_label_metrics").await.expect("💀 head"));
        let outcome = the_store
            .create_index("opensearch_label_metrics", &IndexSettings::default())
            .await
            .expect("💀 the race is benign");
        assert_eq!(outcome, CreateIndexOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn the_one_where_other_create_failures_still_fail() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        assert!(the_store(&server)
            .create_index("broken", &IndexSettings::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn the_one_where_compressed_bulks_announce_themselves() {
        let server = MockServer::start().await;
        let mut config = OpenSearchConfig::new(server.uri());
        config.compress_requests = true;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Content-Encoding", "gzip"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": false,
                "items": [ { "index": { "_id": "a", "status": 200 } } ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = OpenSearchStore::new(config)
            .expect("💀 client")
            .bulk("idx", &[entry("a")])
            .await
            .expect("💀 gzip bulk");
        assert!(!outcome.has_failures());
    }
}
