//! 🏷️ Label metrics: how many open issues and pulls carry each label.
//!
//! Map-valued: each row yields label → count for one side (issues or pulls). The orchestrator
//! merges both sides per repository into one document per label.
//!
//! 🗃️ Both rows also describe a precomputed lookup: one nested terms query across every
//! repository, so a run over 500 repos asks the cluster twice instead of a thousand times.

use anyhow::Result;

use super::{
    Extracted, ISSUES_INDEX, IS_PULL_REQUEST_FIELD, LabelSide, MetricDefinition, PULLS_INDEX,
    PrecomputedLookup, STATE_FIELD,
};
use super::general::{open_issues, open_pulls};
use crate::query::{Aggregation, Filter, SearchRequest, SearchResponse};

pub(crate) const ISSUE_LABELS_AGG: &str = "label_issues";
pub(crate) const PULL_LABELS_AGG: &str = "pull_issues";
const ISSUE_LABEL_FIELD: &str = "issue_labels.keyword";
const PULL_LABEL_FIELD: &str = "pull_labels.keyword";
// -- 🏷️ a repo with more labels than this has bigger problems than metrics
pub(crate) const LABEL_BUCKET_LIMIT: usize = 100_000;

fn issue_labels_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter).with_aggregation(
        ISSUE_LABELS_AGG,
        Aggregation::Terms { field: ISSUE_LABEL_FIELD.into(), size: LABEL_BUCKET_LIMIT },
    )
}

fn pull_labels_request(filter: Filter, index: &str) -> SearchRequest {
    SearchRequest::count(index, filter).with_aggregation(
        PULL_LABELS_AGG,
        Aggregation::Terms { field: PULL_LABEL_FIELD.into(), size: LABEL_BUCKET_LIMIT },
    )
}

fn issue_labels(response: &SearchResponse) -> Result<Extracted> {
    Ok(Extracted::Labels { side: LabelSide::Issues, counts: response.terms(ISSUE_LABELS_AGG)? })
}

fn pull_labels(response: &SearchResponse) -> Result<Extracted> {
    Ok(Extracted::Labels { side: LabelSide::Pulls, counts: response.terms(PULL_LABELS_AGG)? })
}

fn all_open_issues() -> Filter {
    Filter::new()
        .matching(IS_PULL_REQUEST_FIELD, false)
        .matching(STATE_FIELD, "open")
}

fn all_open_pulls() -> Filter {
    Filter::new().matching(STATE_FIELD, "open")
}

pub static DEFINITIONS: &[MetricDefinition] = &[
    MetricDefinition {
        name: "Issue Labels",
        search_index: ISSUES_INDEX,
        build_filter: open_issues,
        build_request: issue_labels_request,
        extract: issue_labels,
        threshold: None,
        precomputed: Some(PrecomputedLookup {
            side: LabelSide::Issues,
            shared_filter: all_open_issues,
            label_field: ISSUE_LABEL_FIELD,
        }),
    },
    MetricDefinition {
        name: "Pull Labels",
        search_index: PULLS_INDEX,
        build_filter: open_pulls,
        build_request: pull_labels_request,
        extract: pull_labels,
        threshold: None,
        precomputed: Some(PrecomputedLookup {
            side: LabelSide::Pulls,
            shared_filter: all_open_pulls,
            label_field: PULL_LABEL_FIELD,
        }),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_each_side_reads_its_own_bucket_list() {
        let the_response: SearchResponse = serde_json::from_value(json!({
            "hits": { "total": 4, "hits": [] },
            "aggregations": {
                "label_issues": { "buckets": [ { "key": "bug", "doc_count": 3 } ] },
                "pull_issues": { "buckets": [ { "key": "docs", "doc_count": 1 } ] }
            }
        }))
        .expect("💀 response should parse");

        match (DEFINITIONS[0].extract)(&the_response).expect("issues side") {
            Extracted::Labels { side, counts } => {
                assert_eq!(side, LabelSide::Issues);
                assert_eq!(counts.get("bug"), Some(&3));
            }
            honestly_who_knows => panic!("💀 expected labels, got {honestly_who_knows:?}"),
        }
        match (DEFINITIONS[1].extract)(&the_response).expect("pulls side") {
            Extracted::Labels { side, counts } => {
                assert_eq!(side, LabelSide::Pulls);
                assert_eq!(counts.get("docs"), Some(&1));
            }
            honestly_who_knows => panic!("💀 expected labels, got {honestly_who_knows:?}"),
        }
    }

    #[test]
    fn the_one_where_the_shared_filter_forgets_the_repository_on_purpose() {
        for definition in DEFINITIONS {
            let lookup = definition.precomputed.expect("💀 label rows are precomputable");
            let body = (lookup.shared_filter)().to_query().to_string();
            assert!(!body.contains("repository.keyword"));
        }
    }
}
