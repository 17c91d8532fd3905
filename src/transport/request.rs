//! Request and response shapes exchanged with the transport collaborator

use std::collections::BTreeMap;

use serde_json::Value;

use crate::routing::PartitionKeyRange;

/// What a partition cursor asks for; fixed for the lifetime of the cursor
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTarget {
    pub range: PartitionKeyRange,
    /// Query text with the resume filter already substituted
    pub query: String,
    /// Resume filter fragment, if the query was narrowed
    pub filter: Option<String>,
}

/// One page request against one partition key range
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub range: PartitionKeyRange,
    pub query: String,
    pub filter: Option<String>,
    pub continuation: Option<String>,
    pub page_size: usize,
    pub headers: BTreeMap<String, String>,
}

impl QueryRequest {
    pub fn new(target: &RequestTarget, continuation: Option<&str>, page_size: usize) -> Self {
        Self {
            range: target.range.clone(),
            query: target.query.clone(),
            filter: target.filter.clone(),
            continuation: continuation.map(str::to_string),
            page_size,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// One page returned by the backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub items: Vec<Value>,
    /// Backend continuation; `None` once the range is exhausted
    pub continuation: Option<String>,
    pub activity_id: String,
    pub request_charge: f64,
    pub response_bytes: u64,
    /// `key=value;...` execution metrics, when the backend reports them
    pub raw_query_metrics: Option<String>,
}
