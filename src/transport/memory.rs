//! In-process backend
//!
//! Serves queries over documents held in memory, partitioned by key range,
//! and doubles as the routing map. Used by the CLI and by tests, which can
//! split ranges, inject failures and inspect the requests sent.
//!
//! # Pages
//!
//! Documents of a partition are served in sort order: the ORDER BY values
//! (when configured) and then the document id in the primary direction.
//! A backend continuation records the position of the last document served,
//! not an offset, so it stays valid for the children of a split range.
//! Rows sharing a rid (as a self-join produces) are told apart by their copy
//! number, so a page may end between two of them.
//!
//! The `filter` of a request is evaluated against each document; the query
//! text itself is not interpreted.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::{QueryError, QueryResult};
use crate::query::{resolve_path, ItemComparer, OrderByItem, ResourceId, ResumeFilter, SortOrder};
use crate::routing::{PartitionKeyRange, Range, RoutingMapProvider};

use super::errors::BackendError;
use super::request::{QueryRequest, QueryResponse};
use super::QueryTransport;

const COLLECTION_ID: u32 = 1;

#[derive(Debug, Clone)]
struct StoredDocument {
    partition_key: String,
    rid: ResourceId,
    copy: u32,
    body: Value,
}

#[derive(Debug)]
struct MemoryPartition {
    range: PartitionKeyRange,
    documents: Vec<StoredDocument>,
    gone: bool,
}

#[derive(Debug)]
struct PendingSplit {
    at: String,
    after_requests: usize,
}

#[derive(Debug, Default)]
struct BackendState {
    partitions: Vec<MemoryPartition>,
    next_range_id: u64,
    next_document: u64,
    pending_splits: HashMap<String, PendingSplit>,
    failures: HashMap<String, VecDeque<BackendError>>,
    requests: Vec<QueryRequest>,
}

impl BackendState {
    fn live(&self) -> impl Iterator<Item = &MemoryPartition> {
        self.partitions.iter().filter(|p| !p.gone)
    }

    fn split(&mut self, range_id: &str, at: &str) -> QueryResult<[PartitionKeyRange; 2]> {
        let idx = self
            .partitions
            .iter()
            .position(|p| !p.gone && p.range.id == range_id)
            .ok_or_else(|| QueryError::internal(format!("no live range {}", range_id)))?;

        let parent = self.partitions[idx].range.clone();
        if at <= parent.min_inclusive.as_str() || at >= parent.max_exclusive.as_str() {
            return Err(QueryError::internal(format!(
                "split point '{}' is outside ({}, {})",
                at, parent.min_inclusive, parent.max_exclusive
            )));
        }

        let left = PartitionKeyRange::new(self.next_range_id.to_string(), parent.min_inclusive.clone(), at)
            .with_parent(parent.id.clone());
        let right = PartitionKeyRange::new((self.next_range_id + 1).to_string(), at, parent.max_exclusive.clone())
            .with_parent(parent.id.clone());
        self.next_range_id += 2;

        let documents = std::mem::take(&mut self.partitions[idx].documents);
        self.partitions[idx].gone = true;

        let (left_docs, right_docs): (Vec<_>, Vec<_>) =
            documents.into_iter().partition(|d| left.contains(&d.partition_key));
        self.partitions.push(MemoryPartition {
            range: left.clone(),
            documents: left_docs,
            gone: false,
        });
        self.partitions.push(MemoryPartition {
            range: right.clone(),
            documents: right_docs,
            gone: false,
        });

        Ok([left, right])
    }
}

/// Backend continuation: the position of the last document served
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Position {
    keys: Vec<OrderByItem>,
    document: u64,
    #[serde(default)]
    copy: u32,
}

pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    order_by_expressions: Vec<String>,
    orders: Vec<SortOrder>,
    latency: Option<Duration>,
}

impl InMemoryBackend {
    /// Backend owning `ranges`, which must tile the keyspace in use.
    pub fn new(ranges: Vec<PartitionKeyRange>) -> Self {
        let next_range_id = ranges
            .iter()
            .filter_map(|r| r.id.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1);

        let partitions = ranges
            .into_iter()
            .map(|range| MemoryPartition {
                range,
                documents: Vec::new(),
                gone: false,
            })
            .collect();

        Self {
            state: Mutex::new(BackendState {
                partitions,
                next_range_id,
                next_document: 1,
                ..BackendState::default()
            }),
            order_by_expressions: Vec::new(),
            orders: Vec::new(),
            latency: None,
        }
    }

    /// Ranges between consecutive `bounds`, with ids `"0"`, `"1"`, ...
    pub fn uniform(bounds: &[&str]) -> Self {
        let ranges = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| PartitionKeyRange::new(i.to_string(), w[0], w[1]))
            .collect();
        Self::new(ranges)
    }

    /// Serves every query as ORDER BY over `expressions`.
    pub fn with_order_by(mut self, expressions: Vec<String>, orders: Vec<SortOrder>) -> Self {
        self.order_by_expressions = expressions;
        self.orders = orders;
        self
    }

    /// Delays every response.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a document in the range owning `partition_key`. Object bodies
    /// get their `_rid` set.
    pub fn insert(&self, partition_key: &str, body: Value) -> QueryResult<ResourceId> {
        self.insert_copies(partition_key, body, 1)
    }

    /// Stores `copies` rows sharing one rid and body, served back to back.
    pub fn insert_copies(&self, partition_key: &str, mut body: Value, copies: u32) -> QueryResult<ResourceId> {
        let mut state = self.lock();
        let idx = state
            .partitions
            .iter()
            .position(|p| !p.gone && p.range.contains(partition_key))
            .ok_or_else(|| QueryError::internal(format!("no range owns key '{}'", partition_key)))?;

        let rid = ResourceId::new(COLLECTION_ID, state.next_document);
        state.next_document += 1;
        if let Some(object) = body.as_object_mut() {
            object.insert("_rid".to_string(), Value::String(rid.encode()));
        }

        for copy in 0..copies.max(1) {
            state.partitions[idx].documents.push(StoredDocument {
                partition_key: partition_key.to_string(),
                rid,
                copy,
                body: body.clone(),
            });
        }
        Ok(rid)
    }

    /// Current ranges, sorted by `min_inclusive`
    pub fn target_ranges(&self) -> Vec<PartitionKeyRange> {
        let mut ranges: Vec<PartitionKeyRange> = self.lock().live().map(|p| p.range.clone()).collect();
        ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
        ranges
    }

    /// Splits a range at `at` now; returns the two children.
    pub fn split(&self, range_id: &str, at: &str) -> QueryResult<[PartitionKeyRange; 2]> {
        self.lock().split(range_id, at)
    }

    /// Splits a range at `at` once `after_requests` more pages were served
    /// from it; the request after that sees the range gone.
    pub fn split_after(&self, range_id: &str, at: &str, after_requests: usize) {
        self.lock().pending_splits.insert(
            range_id.to_string(),
            PendingSplit {
                at: at.to_string(),
                after_requests,
            },
        );
    }

    /// Fails the next request against `range_id` with `error`. Queued
    /// failures are returned in order.
    pub fn inject_failure(&self, range_id: &str, error: BackendError) {
        self.lock()
            .failures
            .entry(range_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Every request received, in arrival order
    pub fn requests(&self) -> Vec<QueryRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self, range_id: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.range.id == range_id)
            .count()
    }

    fn sort_keys(&self, body: &Value) -> Vec<OrderByItem> {
        self.order_by_expressions
            .iter()
            .map(|expr| match resolve_path(body, expr) {
                Some(value) => OrderByItem::new(value.clone()),
                None => OrderByItem::undefined(),
            })
            .collect()
    }

    fn compare(&self, a: (&[OrderByItem], u64, u32), b: (&[OrderByItem], u64, u32)) -> Ordering {
        let primary = self.orders.first().copied().unwrap_or(SortOrder::Ascending);
        ItemComparer::compare_items(a.0, b.0, &self.orders)
            .then_with(|| primary.apply(a.1.cmp(&b.1)))
            .then_with(|| a.2.cmp(&b.2))
    }

    fn item(&self, document: &StoredDocument, keys: Vec<OrderByItem>) -> Value {
        if self.order_by_expressions.is_empty() {
            return document.body.clone();
        }
        json!({
            "_rid": document.rid.encode(),
            "orderByItems": keys,
            "payload": document.body,
        })
    }

    fn serve(&self, request: &QueryRequest) -> Result<QueryResponse, BackendError> {
        let mut state = self.lock();
        state.requests.push(request.clone());
        let range_id = request.range.id.as_str();

        if let Some(error) = state.failures.get_mut(range_id).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        if let Some(pending) = state.pending_splits.get_mut(range_id) {
            if pending.after_requests == 0 {
                let at = pending.at.clone();
                state.pending_splits.remove(range_id);
                state
                    .split(range_id, &at)
                    .map_err(|e| BackendError::service_unavailable(e.to_string()))?;
                return Err(BackendError::partition_split(range_id));
            }
            pending.after_requests -= 1;
        }

        let partition = state
            .partitions
            .iter()
            .find(|p| p.range.id == range_id)
            .ok_or_else(|| BackendError::bad_request(format!("unknown partition key range {}", range_id)))?;
        if partition.gone {
            return Err(BackendError::partition_split(range_id));
        }

        let filter = match &request.filter {
            Some(text) => Some(ResumeFilter::parse(text).map_err(|e| BackendError::bad_request(e.to_string()))?),
            None => None,
        };
        let after = match &request.continuation {
            Some(text) => Some(
                serde_json::from_str::<Position>(text)
                    .map_err(|e| BackendError::bad_request(format!("invalid continuation: {}", e)))?,
            ),
            None => None,
        };

        let mut matched: Vec<(Vec<OrderByItem>, &StoredDocument)> = partition
            .documents
            .iter()
            .filter(|d| filter.as_ref().map_or(true, |f| f.matches(&d.body)))
            .map(|d| (self.sort_keys(&d.body), d))
            .collect();
        matched.sort_by(|a, b| {
            self.compare(
                (a.0.as_slice(), a.1.rid.document(), a.1.copy),
                (b.0.as_slice(), b.1.rid.document(), b.1.copy),
            )
        });

        let remaining: Vec<(Vec<OrderByItem>, &StoredDocument)> = match &after {
            Some(position) => matched
                .into_iter()
                .filter(|(keys, d)| {
                    self.compare(
                        (keys.as_slice(), d.rid.document(), d.copy),
                        (position.keys.as_slice(), position.document, position.copy),
                    ) == Ordering::Greater
                })
                .collect(),
            None => matched,
        };

        let page_size = request.page_size.max(1);
        let has_more = remaining.len() > page_size;
        let served: Vec<(Vec<OrderByItem>, &StoredDocument)> = remaining.into_iter().take(page_size).collect();

        let continuation = match (has_more, served.last()) {
            (true, Some((keys, d))) => Some(
                serde_json::to_string(&Position {
                    keys: keys.clone(),
                    document: d.rid.document(),
                    copy: d.copy,
                })
                .map_err(|e| BackendError::service_unavailable(e.to_string()))?,
            ),
            _ => None,
        };

        let items: Vec<Value> = served
            .into_iter()
            .map(|(keys, d)| self.item(d, keys))
            .collect();
        let response_bytes: u64 = items.iter().map(|i| i.to_string().len() as u64).sum();
        let charge = 2.0 + items.len() as f64 * 0.5;

        Ok(QueryResponse {
            raw_query_metrics: Some(format!(
                "retrievedDocumentCount={};retrievedDocumentSize={};outputDocumentCount={};outputDocumentSize={};indexUtilizationRatio=1.00;totalExecutionTimeInMs=0.05",
                items.len(),
                response_bytes,
                items.len(),
                response_bytes
            )),
            items,
            continuation,
            activity_id: Uuid::new_v4().to_string(),
            request_charge: charge,
            response_bytes,
        })
    }
}

impl QueryTransport for InMemoryBackend {
    fn execute<'a>(&'a self, request: QueryRequest) -> BoxFuture<'a, Result<QueryResponse, BackendError>> {
        Box::pin(async move {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.serve(&request)
        })
    }
}

impl RoutingMapProvider for InMemoryBackend {
    fn overlapping_ranges<'a>(&'a self, range: &'a Range) -> BoxFuture<'a, QueryResult<Vec<PartitionKeyRange>>> {
        Box::pin(async move {
            let mut ranges: Vec<PartitionKeyRange> = self
                .lock()
                .live()
                .filter(|p| p.range.overlaps(range))
                .map(|p| p.range.clone())
                .collect();
            ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
            Ok(ranges)
        })
    }
}
