//! 💀 error.rs: the short list of ways a metrics run can die.
//!
//! Most of pmx speaks `anyhow` (context chains, 💀 prefixes, the usual).
//! These variants are the few a caller might want to `downcast_ref` and react to.
//! Everything else is just a sad story with a stack of `.context()` on top. 🦆

use std::time::Duration;

/// 🏷️ Run-level failures worth telling apart.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 📡 The store answered a search with a non-2xx. We do not retry. We leave.
    #[error("💀 Error connecting to the cluster: search on '{index}' came back {status}: {body}")]
    QueryStatus {
        index: String,
        status: u16,
        body: String,
    },

    /// 🧩 The response arrived but an aggregation or field we need is missing or the wrong shape.
    #[error("💀 Malformed search response: {0}")]
    MalformedResponse(String),

    /// ⏱️ The bulk writers did not all finish inside the window. Fatal for the run.
    /// In-flight requests keep going in the background. They will not be waited on.
    #[error("💀 Bulk write to '{index}' timed out after {timeout:?} with {outstanding} partition(s) still in flight")]
    BulkWriteTimeout {
        index: String,
        timeout: Duration,
        outstanding: usize,
    },
}
