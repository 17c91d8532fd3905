//! Cross-partition execution
//!
//! The source stage of every query: one cursor tree per target range, merged
//! under either the parallel or the ORDER BY policy.
//!
//! # Components
//!
//! - [`PartitionForest`]: trees, merge queue, prefetch scheduler, telemetry
//! - [`MergePolicy`]: how trees are ordered for draining and prefetch
//! - [`PrefetchScheduler`]: bounded background fetches under the buffer budget
//! - Continuation token formats for both merges
//!
//! # Rules
//!
//! 1. Target ranges are sorted by `min_inclusive` before anything is built
//! 2. A continuation is validated in full before the first request is sent
//! 3. Every drain ends on a point the continuation can describe exactly

mod continuation;
mod forest;
mod order_by;
mod parallel;
mod policy;
mod scheduler;

pub use continuation::{parse_token_list, CompositeContinuationToken, OrderByContinuationToken};
pub use forest::{ForestDiagnostics, PartitionForest, TreeSeed};
pub use order_by::OrderByCrossPartition;
pub use parallel::ParallelCrossPartition;
pub use policy::{MergePolicy, OrderByKey, OrderByMerge, ParallelMerge};
pub use scheduler::PrefetchScheduler;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionConfig;
use crate::errors::QueryResult;
use crate::observability::RequestChargeTracker;
use crate::pipeline::QueryStage;
use crate::producer::{BufferBudget, FetchCompletion, FetchContext, PageSizing};
use crate::query::{format_query, QueryInfo};
use crate::routing::{PartitionKeyRange, RoutingMapProvider};
use crate::transport::{QueryTransport, RetryPolicy};

/// Everything a query execution is built from
#[derive(Clone)]
pub struct CrossPartitionParams {
    pub config: ExecutionConfig,
    pub query_info: QueryInfo,
    /// Ranges the query targets, sorted by `min_inclusive`
    pub target_ranges: Vec<PartitionKeyRange>,
    pub transport: Arc<dyn QueryTransport>,
    pub routing: Arc<dyn RoutingMapProvider>,
    pub retry_policy: Arc<dyn RetryPolicy>,
}

impl CrossPartitionParams {
    pub fn new(
        config: ExecutionConfig,
        query_info: QueryInfo,
        mut target_ranges: Vec<PartitionKeyRange>,
        transport: Arc<dyn QueryTransport>,
        routing: Arc<dyn RoutingMapProvider>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        target_ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
        Self {
            config,
            query_info,
            target_ranges,
            transport,
            routing,
            retry_policy,
        }
    }

    /// Rewritten query text with `filter` in the resume placeholder
    pub fn formatted_query(&self, filter: Option<&str>) -> String {
        format_query(&self.query_info.rewritten_query, filter)
    }
}

/// Shared collaborators and counters for one execution, plus the receiving
/// end of its fetch-completion channel.
pub(crate) fn fetch_context(
    params: &CrossPartitionParams,
    page_sizing: PageSizing,
) -> (Arc<FetchContext>, mpsc::UnboundedReceiver<FetchCompletion>) {
    let (completions, receiver) = mpsc::unbounded_channel();
    let context = FetchContext {
        transport: Arc::clone(&params.transport),
        routing: Arc::clone(&params.routing),
        retry_policy: Arc::clone(&params.retry_policy),
        budget: BufferBudget::new(params.config.max_buffered_item_count),
        charge: Arc::new(RequestChargeTracker::new()),
        completions,
        page_sizing,
        page_queue_depth: params.config.page_queue_depth,
    };
    (Arc::new(context), receiver)
}

/// Builds the source stage: ORDER BY merge when the query sorts, parallel
/// drain otherwise.
pub async fn create_source(
    params: &CrossPartitionParams,
    continuation: Option<&Value>,
    cancel: &CancellationToken,
) -> QueryResult<Box<dyn QueryStage>> {
    if params.query_info.has_order_by() {
        let source = OrderByCrossPartition::create(params, continuation, cancel).await?;
        Ok(Box::new(source))
    } else {
        let source = ParallelCrossPartition::create(params, continuation)?;
        Ok(Box::new(source))
    }
}
