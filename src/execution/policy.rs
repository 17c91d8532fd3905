//! Merge policies
//!
//! A policy tells the forest how to order partitions for draining and how
//! urgently each partition needs a background fetch.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::errors::{QueryError, QueryResult};
use crate::producer::PartitionCursor;
use crate::query::{ItemComparer, OrderByItem, OrderByQueryResult, ResourceId, SortOrder};

pub trait MergePolicy: Send + Sync + 'static {
    type Key: Ord + Send + Sync;

    /// Sort key of a cursor; the smallest key drains first.
    fn key(&self, cursor: &PartitionCursor) -> QueryResult<Self::Key>;

    /// Prefetch priority for a cursor of the `tree_index`-th tree; lower
    /// values are fetched first.
    fn fetch_priority(&self, tree_index: usize, cursor: &PartitionCursor) -> u64;
}

/// Drains partitions strictly left to right
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelMerge;

impl MergePolicy for ParallelMerge {
    type Key = String;

    fn key(&self, cursor: &PartitionCursor) -> QueryResult<String> {
        Ok(cursor.range().min_inclusive.clone())
    }

    fn fetch_priority(&self, tree_index: usize, _cursor: &PartitionCursor) -> u64 {
        tree_index as u64
    }
}

/// K-way merge on the ORDER BY values of each partition's current document
#[derive(Debug, Clone)]
pub struct OrderByMerge {
    orders: Arc<[SortOrder]>,
}

impl OrderByMerge {
    pub fn new(orders: Arc<[SortOrder]>) -> Self {
        Self { orders }
    }

    pub fn orders(&self) -> &Arc<[SortOrder]> {
        &self.orders
    }
}

impl MergePolicy for OrderByMerge {
    type Key = OrderByKey;

    fn key(&self, cursor: &PartitionCursor) -> QueryResult<OrderByKey> {
        let item = cursor
            .current()
            .ok_or_else(|| QueryError::internal("order-by key of an unpositioned cursor"))?;
        let result = OrderByQueryResult::from_value(item)?;

        if result.order_by_items.len() != self.orders.len() {
            return Err(QueryError::unexpected_response(format!(
                "expected {} order-by items, got {}",
                self.orders.len(),
                result.order_by_items.len()
            )));
        }

        let document = ResourceId::parse(&result.rid)
            .ok_or_else(|| QueryError::unexpected_response(format!("unparsable rid '{}'", result.rid)))?
            .document();

        Ok(OrderByKey {
            items: result.order_by_items,
            orders: Arc::clone(&self.orders),
            document,
            range_min: cursor.range().min_inclusive.clone(),
        })
    }

    /// Partitions holding the fewest buffered documents are refilled first.
    fn fetch_priority(&self, _tree_index: usize, cursor: &PartitionCursor) -> u64 {
        cursor.fetcher().buffered_items() as u64
    }
}

/// Sort values of a document, its document id and the range it came from.
///
/// Equal sort values order by document id in the primary direction, the
/// same order every partition returns them in. The range only separates
/// identical rows of different partitions.
#[derive(Debug, Clone)]
pub struct OrderByKey {
    items: Vec<OrderByItem>,
    orders: Arc<[SortOrder]>,
    document: u64,
    range_min: String,
}

impl Ord for OrderByKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let primary = self.orders.first().copied().unwrap_or(SortOrder::Ascending);
        ItemComparer::compare_items(&self.items, &other.items, &self.orders)
            .then_with(|| primary.apply(self.document.cmp(&other.document)))
            .then_with(|| self.range_min.cmp(&other.range_min))
    }
}

impl PartialOrd for OrderByKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrderByKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderByKey {}
