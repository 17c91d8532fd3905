//! Caller surface
//!
//! [`QueryExecution`] is what a client holds for one query: it builds the
//! pipeline (resuming from a continuation if one is given) and hands out one
//! [`FeedPage`] per [`execute_next`](QueryExecution::execute_next).

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{QueryError, QueryResult};
use crate::execution::CrossPartitionParams;
use crate::observability::{ClientSideMetrics, Event, PartitionedQueryMetrics};

use super::{build_pipeline, QueryStage};

/// One page of results
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<Value>,
    /// Opaque token to resume after this page; `None` on the last page
    pub continuation: Option<String>,
    pub request_charge: f64,
    pub partitioned_metrics: PartitionedQueryMetrics,
    pub client_metrics: ClientSideMetrics,
    pub activity_ids: Vec<String>,
}

pub struct QueryExecution {
    query_id: Uuid,
    pipeline: Box<dyn QueryStage>,
    max_item_count: usize,
    pages_returned: u64,
    items_returned: u64,
    complete: bool,
}

impl QueryExecution {
    /// Builds the pipeline. A continuation is validated in full here, before
    /// any page is returned.
    pub async fn create(
        params: CrossPartitionParams,
        continuation: Option<&str>,
        cancel: &CancellationToken,
    ) -> QueryResult<Self> {
        params.config.validate()?;

        let query_id = Uuid::new_v4();
        info!(
            event = %Event::QueryStart,
            query_id = %query_id,
            partitions = params.target_ranges.len(),
            order_by = params.query_info.has_order_by(),
            resumed = continuation.is_some(),
            "query execution starting"
        );

        let token = match continuation {
            None => None,
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(token) => Some(token),
                Err(e) => {
                    let error = QueryError::malformed_continuation(format!("not JSON: {}", e));
                    warn!(event = %Event::ContinuationRejected, query_id = %query_id, "{}", error);
                    return Err(error);
                }
            },
        };

        let pipeline = match build_pipeline(&params, token.as_ref(), cancel).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                if matches!(e, QueryError::MalformedContinuation(_)) {
                    warn!(event = %Event::ContinuationRejected, query_id = %query_id, "{}", e);
                }
                return Err(e);
            }
        };

        Ok(Self {
            query_id,
            pipeline,
            max_item_count: params.config.max_item_count,
            pages_returned: 0,
            items_returned: 0,
            complete: false,
        })
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn is_done(&self) -> bool {
        self.pipeline.is_done()
    }

    /// Returns the next non-empty page, or an empty final page once the
    /// pipeline runs dry. Telemetry from every fetch since the previous
    /// page is attached.
    pub async fn execute_next(&mut self, cancel: &CancellationToken) -> QueryResult<FeedPage> {
        let mut items = Vec::new();
        while items.is_empty() && !self.pipeline.is_done() {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            items = match self.pipeline.drain(self.max_item_count, cancel).await {
                Ok(items) => items,
                Err(QueryError::Cancelled) => return Err(self.cancelled()),
                Err(e) => return Err(e),
            };
        }

        let continuation = if self.pipeline.is_done() {
            None
        } else {
            self.pipeline.continuation_token()?.map(|token| token.to_string())
        };

        let diagnostics = self.pipeline.take_diagnostics();
        self.pages_returned += 1;
        self.items_returned += items.len() as u64;

        debug!(
            event = %Event::PageReturned,
            query_id = %self.query_id,
            page = self.pages_returned,
            items = items.len(),
            charge = diagnostics.request_charge,
            has_continuation = continuation.is_some(),
            "page returned"
        );

        if continuation.is_none() && !self.complete {
            self.complete = true;
            info!(
                event = %Event::QueryComplete,
                query_id = %self.query_id,
                pages = self.pages_returned,
                items = self.items_returned,
                "query execution complete"
            );
        }

        Ok(FeedPage {
            items,
            continuation,
            request_charge: diagnostics.request_charge,
            partitioned_metrics: diagnostics.partitioned_metrics,
            client_metrics: diagnostics.client_metrics,
            activity_ids: diagnostics.activity_ids,
        })
    }

    fn cancelled(&self) -> QueryError {
        info!(
            event = %Event::QueryCancelled,
            query_id = %self.query_id,
            pages = self.pages_returned,
            "query execution cancelled"
        );
        QueryError::Cancelled
    }
}
