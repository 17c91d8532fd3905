//! Values flowing out of a partition fetcher

use serde_json::Value;

use crate::errors::QueryError;
use crate::observability::{FetchExecutionRange, QueryMetrics};

/// One backend page, as buffered for the consumer
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Value>,
    /// Continuation the page was requested with; replaying it yields this page again
    pub request_token: Option<String>,
    /// Continuation for the following page; `None` on the last page
    pub continuation: Option<String>,
    pub activity_id: String,
    pub request_charge: f64,
}

/// A page or the error that ended the partition, delivered in fetch order
pub type PageResult = Result<Page, QueryError>;

/// Report of one successful fetch, sent to the forest for aggregation
#[derive(Debug, Clone)]
pub struct FetchCompletion {
    pub partition_id: String,
    pub item_count: usize,
    pub request_charge: f64,
    pub response_bytes: u64,
    pub query_metrics: Option<QueryMetrics>,
    pub execution_range: FetchExecutionRange,
    pub has_more: bool,
}
