//! 🔍 query.rs: the tiny slice of the search DSL we actually speak.
//!
//! 🎯 Bool filters (match / terms / exists / range), total hits, and five aggregation
//! shapes: sum, avg, cardinality, terms, nested terms. Plus reading a field out of
//! `_source` when a metric just wants "the number on the first hit".
//!
//! ⚠️ This is not a query builder library. It is a phrasebook. It knows enough to order
//! coffee and ask where the bathroom is. Anything fancier and you're on your own. 🦆

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::PipelineError;

/// 🧱 A bool query, assembled one clause at a time.
///
/// `must` clauses use `match`, `must_not` carries exclusions, `filter` carries ranges
/// (no scoring, we're counting, not ranking).
///
/// 🧩 Builder-by-value: every method takes `self` and hands it back, so a metric row's
/// filter reads top to bottom like the sentence it is. "Alpha's issues, open, not bots."
/// Clause order is kept exactly as written, which is what makes request bodies testable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    must: Vec<Value>,
    must_not: Vec<Value>,
    filter: Vec<Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// ✅ `field` must match `value`. Strings, bools, numbers: anything `serde_json` can hold.
    pub fn matching(mut self, field: &str, value: impl Into<Value>) -> Self {
        let value: Value = value.into();
        self.must.push(json!({ "match": { field: value } }));
        self
    }

    /// 🚫 `field` must not exist at all. How unlabelled things get found.
    pub fn missing(mut self, field: &str) -> Self {
        self.must_not.push(json!({ "exists": { "field": field } }));
        self
    }

    /// 🚫 `field` must not be any of `values`. Bots, mostly.
    pub fn excluding(mut self, field: &str, values: &[&str]) -> Self {
        self.must_not.push(json!({ "terms": { field: values } }));
        self
    }

    /// 🎯 `field` must be one of `values`. Non-scoring; lives in `filter`.
    pub fn any_of<S: AsRef<str>>(mut self, field: &str, values: &[S]) -> Self {
        let values: Vec<&str> = values.iter().map(AsRef::as_ref).collect();
        self.filter.push(json!({ "terms": { field: values } }));
        self
    }

    /// 📅 Range on `field`; either bound may be left open. Date math welcome (`now-29d/d`).
    /// Both open is legal and matches anything with the field. Pointless, but legal. ⚖️
    pub fn range(mut self, field: &str, gte: Option<&str>, lte: Option<&str>) -> Self {
        let mut bounds = Map::new();
        if let Some(gte) = gte {
            bounds.insert("gte".into(), Value::from(gte));
        }
        if let Some(lte) = lte {
            bounds.insert("lte".into(), Value::from(lte));
        }
        self.filter.push(json!({ "range": { field: bounds } }));
        self
    }

    /// 🔤 Render into the `{"bool": {...}}` the store expects. Empty clause lists are left out.
    pub fn to_query(&self) -> Value {
        let mut bool_query = Map::new();
        for (clause, entries) in [
            ("must", &self.must),
            ("must_not", &self.must_not),
            ("filter", &self.filter),
        ] {
            if !entries.is_empty() {
                bool_query.insert(clause.into(), Value::Array(entries.clone()));
            }
        }
        json!({ "bool": bool_query })
    }
}

/// 📊 The aggregation shapes we know how to ask for (and, crucially, how to read back).
///
/// Every variant has a matching reader on [`SearchResponse`]. Ask with one, read with the
/// other, under the same name. Mismatch them and you get a `MalformedResponse`, not a guess.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// ➕ Comments, reactions, anything that adds up.
    Sum { field: String },
    /// ➗ Open times, merge times. Reads back as zero over nothing.
    Avg { field: String },
    /// 🧑‍🤝‍🧑 Approximately-distinct count. "Approximately" is doing some work there,
    /// but under a few thousand contributors the store is exact enough for a dashboard.
    Cardinality { field: String },
    /// 🪣 Top `size` keys with their doc counts. Anything past `size` quietly falls off.
    Terms { field: String, size: usize },
    /// 🪆 terms inside terms: outer bucket per `outer_field`, inner buckets per `inner_field`.
    NestedTerms {
        outer_field: String,
        outer_size: usize,
        inner_name: String,
        inner_field: String,
        inner_size: usize,
    },
}

impl Aggregation {
    fn to_body(&self) -> Value {
        match self {
            Aggregation::Sum { field } => json!({ "sum": { "field": field } }),
            Aggregation::Avg { field } => json!({ "avg": { "field": field } }),
            Aggregation::Cardinality { field } => json!({ "cardinality": { "field": field } }),
            Aggregation::Terms { field, size } => {
                json!({ "terms": { "field": field, "size": size } })
            }
            Aggregation::NestedTerms {
                outer_field,
                outer_size,
                inner_name,
                inner_field,
                inner_size,
            } => json!({
                "terms": { "field": outer_field, "size": outer_size },
                "aggs": { inner_name: { "terms": { "field": inner_field, "size": inner_size } } }
            }),
        }
    }
}

/// 📡 One search: which index, which filter, what to aggregate, what to pull from `_source`.
///
/// Plain data, `PartialEq` and all, so tests can assert on exactly what would have been
/// sent without a cluster anywhere near them. 🧪
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index: String,
    pub filter: Filter,
    /// 📄 Hits to return. Zero for counting, which is most of the time.
    pub size: usize,
    pub aggregations: Vec<(String, Aggregation)>,
    pub source_fields: Option<Vec<String>>,
}

impl SearchRequest {
    /// 🔢 A request that only cares about the count (and maybe aggregations).
    pub fn count(index: &str, filter: Filter) -> Self {
        Self {
            index: index.to_string(),
            filter,
            size: 0,
            aggregations: Vec::new(),
            source_fields: None,
        }
    }

    /// 📊 Add a named aggregation. The name is how the matching reader finds it later.
    pub fn with_aggregation(mut self, name: &str, aggregation: Aggregation) -> Self {
        self.aggregations.push((name.to_string(), aggregation));
        self
    }

    /// 📄 Ask for up to `size` hits, `_source` trimmed to `fields`.
    pub fn with_source(mut self, size: usize, fields: &[&str]) -> Self {
        self.size = size;
        self.source_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// 📦 The JSON body for `POST {index}/_search`. `track_total_hits` is always on:
    /// the store caps totals at 10k otherwise, and a capped count is a wrong count.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "size": self.size,
            "track_total_hits": true,
            "query": self.filter.to_query(),
        });
        if !self.aggregations.is_empty() {
            let aggs: Map<String, Value> = self
                .aggregations
                .iter()
                .map(|(name, agg)| (name.clone(), agg.to_body()))
                .collect();
            body["aggs"] = Value::Object(aggs);
        }
        if let Some(fields) = &self.source_fields {
            body["_source"] = json!(fields);
        }
        body
    }
}

// -- 🧮 `hits.total` is an object on modern clusters and a bare number on ancient ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TotalHits {
    Modern { value: i64 },
    Ancient(i64),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Hits {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<SearchHit>,
}

/// 📄 A single hit. We only ever look at `_source`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_source", default)]
    pub source: Value,
}

/// 📬 What came back from `_search`, typed just enough to be useful.
///
/// Aggregations stay as raw JSON until someone asks for one by name and shape. The readers
/// below do the asking; each one fails with `MalformedResponse` instead of making a number up.
/// 🎬 *[the response arrives. it has a hundred fields. we read three. nobody is offended.]*
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    hits: Hits,
    #[serde(default)]
    aggregations: Map<String, Value>,
}

fn malformed(msg: String) -> anyhow::Error {
    PipelineError::MalformedResponse(msg).into()
}

impl SearchResponse {
    /// 🔢 `hits.total`. Missing means the store didn't track totals, which we always ask for.
    pub fn total_hits(&self) -> anyhow::Result<i64> {
        match &self.hits.total {
            Some(TotalHits::Modern { value }) | Some(TotalHits::Ancient(value)) => Ok(*value),
            None => Err(malformed("hits.total is missing".into())),
        }
    }

    /// 📄 The hits themselves, for the rare row that wants more than a count.
    pub fn hits(&self) -> &[SearchHit] {
        &self.hits.hits
    }

    fn aggregation(&self, name: &str) -> anyhow::Result<&Value> {
        self.aggregations
            .get(name)
            .ok_or_else(|| malformed(format!("aggregation '{name}' is missing")))
    }

    // -- 🕳️ single-value aggs report `null` over zero documents. zero is the honest answer.
    fn single_value(&self, name: &str) -> anyhow::Result<f64> {
        match self.aggregation(name)?.get("value") {
            Some(Value::Null) => Ok(0.0),
            Some(v) => v
                .as_f64()
                .ok_or_else(|| malformed(format!("aggregation '{name}' value is not a number: {v}"))),
            None => Err(malformed(format!("aggregation '{name}' has no value"))),
        }
    }

    /// ➕ A `sum` aggregation's value.
    pub fn sum(&self, name: &str) -> anyhow::Result<f64> {
        self.single_value(name)
    }

    /// ➗ An `avg` aggregation's value; empty or infinite averages come back as 0.
    pub fn avg(&self, name: &str) -> anyhow::Result<f64> {
        let value = self.single_value(name)?;
        Ok(if value.is_finite() { value } else { 0.0 })
    }

    /// 🧑‍🤝‍🧑 A `cardinality` aggregation's value.
    pub fn cardinality(&self, name: &str) -> anyhow::Result<i64> {
        Ok(self.single_value(name)? as i64)
    }

    /// 🪣 A `terms` aggregation as key → doc_count. Numeric and bool keys are stringified;
    /// the cluster is inconsistent about key types and we'd rather not be.
    pub fn terms(&self, name: &str) -> anyhow::Result<HashMap<String, i64>> {
        read_buckets(self.aggregation(name)?, name)
    }

    /// 🪆 A nested terms aggregation as outer key → (inner key → doc_count).
    pub fn nested_terms(
        &self,
        outer_name: &str,
        inner_name: &str,
    ) -> anyhow::Result<HashMap<String, HashMap<String, i64>>> {
        let outer = self.aggregation(outer_name)?;
        let buckets = bucket_list(outer, outer_name)?;
        let mut nested = HashMap::with_capacity(buckets.len());
        for bucket in buckets {
            let key = bucket_key(bucket, outer_name)?;
            let inner = bucket.get(inner_name).ok_or_else(|| {
                malformed(format!("bucket '{key}' of '{outer_name}' lacks '{inner_name}'"))
            })?;
            nested.insert(key, read_buckets(inner, inner_name)?);
        }
        Ok(nested)
    }

    /// 📄 `_source[field]` of the first hit, if there is a first hit and it has that field.
    pub fn first_source_field(&self, field: &str) -> Option<&Value> {
        self.hits.hits.first().and_then(|hit| hit.source.get(field))
    }
}

fn bucket_list<'a>(agg: &'a Value, name: &str) -> anyhow::Result<&'a Vec<Value>> {
    agg.get("buckets")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(format!("aggregation '{name}' has no buckets array")))
}

fn bucket_key(bucket: &Value, name: &str) -> anyhow::Result<String> {
    match bucket.get("key") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other @ (Value::Number(_) | Value::Bool(_))) => Ok(other.to_string()),
        _ => Err(malformed(format!("a bucket of '{name}' has no usable key"))),
    }
}

// -- 🪣 buckets → map. a bucket without a doc_count isn't a bucket, it's a rumor
fn read_buckets(agg: &Value, name: &str) -> anyhow::Result<HashMap<String, i64>> {
    let buckets = bucket_list(agg, name)?;
    let mut counts = HashMap::with_capacity(buckets.len());
    for bucket in buckets {
        let key = bucket_key(bucket, name)?;
        let doc_count = bucket
            .get("doc_count")
            .and_then(Value::as_i64)
            .ok_or_else(|| malformed(format!("bucket '{key}' of '{name}' has no doc_count")))?;
        counts.insert(key, doc_count);
    }
    Ok(counts)
}
