//! Per-partition page fetcher
//!
//! The producer half of a partition cursor. Pages are fetched one at a time
//! (a single-permit gate) either in the background by the prefetch
//! scheduler or on demand by the consumer, and are delivered in fetch order
//! through a bounded channel.
//!
//! # Ordering
//!
//! On success the queued-page counter is raised first, then fetch state is
//! updated, then the completion and the page are sent. A consumer that sees
//! no queued page and no remaining backend results can therefore conclude
//! the partition is done.
//!
//! Failures are delivered as `Err` values in the page stream, after every
//! page fetched before them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::errors::{QueryError, QueryResult};
use crate::observability::{Event, FetchExecutionRange, QueryMetrics};
use crate::routing::PartitionKeyRange;
use crate::transport::{BackendError, QueryResponse, RequestTarget, RetryDecision};

use super::budget::Reservation;
use super::context::FetchContext;
use super::page::{FetchCompletion, Page, PageResult};

/// How a fetch was admitted
pub enum FetchMode {
    /// Background fetch holding a budget reservation
    Prefetch(Reservation),
    /// The consumer is waiting; budget is reserved at fetch time
    Demand,
}

#[derive(Debug, Default)]
struct FetchState {
    continuation: Option<String>,
    started: bool,
    failed: bool,
    successful_fetches: u32,
}

impl FetchState {
    fn has_more(&self) -> bool {
        !self.failed && (!self.started || self.continuation.is_some())
    }
}

pub struct PageFetcher {
    target: RequestTarget,
    context: Arc<FetchContext>,
    gate: Semaphore,
    state: Mutex<FetchState>,
    pages: mpsc::Sender<PageResult>,
    queued_pages: AtomicUsize,
    buffered_items: AtomicUsize,
    prefetch_pending: AtomicBool,
}

impl PageFetcher {
    /// Creates a fetcher starting at `continuation` and the receiving end of
    /// its page stream.
    pub fn new(
        context: Arc<FetchContext>,
        target: RequestTarget,
        continuation: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<PageResult>) {
        let (tx, rx) = mpsc::channel(context.page_queue_depth.max(1));
        let fetcher = Arc::new(Self {
            target,
            context,
            gate: Semaphore::new(1),
            state: Mutex::new(FetchState {
                continuation,
                ..FetchState::default()
            }),
            pages: tx,
            queued_pages: AtomicUsize::new(0),
            buffered_items: AtomicUsize::new(0),
            prefetch_pending: AtomicBool::new(false),
        });
        (fetcher, rx)
    }

    pub fn target(&self) -> &RequestTarget {
        &self.target
    }

    pub fn range(&self) -> &PartitionKeyRange {
        &self.target.range
    }

    pub fn context(&self) -> &Arc<FetchContext> {
        &self.context
    }

    fn state(&self) -> MutexGuard<'_, FetchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Page size the next fetch will request
    pub fn page_size(&self) -> usize {
        self.context
            .page_sizing
            .page_size(self.state().successful_fetches)
    }

    pub fn successful_fetches(&self) -> u32 {
        self.state().successful_fetches
    }

    /// True until the backend reported the last page or a fetch failed
    pub fn has_more_backend_results(&self) -> bool {
        self.state().has_more()
    }

    /// Backend continuation the next fetch will use
    pub fn backend_continuation(&self) -> Option<String> {
        self.state().continuation.clone()
    }

    /// Pages fetched but not yet received by the consumer
    pub fn queued_pages(&self) -> usize {
        self.queued_pages.load(Ordering::SeqCst)
    }

    /// Documents fetched but not yet taken by the consumer
    pub fn buffered_items(&self) -> usize {
        self.buffered_items.load(Ordering::SeqCst)
    }

    /// Whether a background fetch would be useful right now
    pub fn wants_prefetch(&self) -> bool {
        !self.prefetch_pending.load(Ordering::SeqCst)
            && self.queued_pages() < self.context.page_queue_depth
            && self.has_more_backend_results()
    }

    /// Claims the single background-fetch slot.
    pub fn begin_prefetch(&self) -> bool {
        self.prefetch_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_prefetch(&self) {
        self.prefetch_pending.store(false, Ordering::SeqCst);
    }

    /// Called by the consumer for each page it receives.
    pub(crate) fn page_received(&self) {
        let _ = self
            .queued_pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    /// Called by the consumer for each document it takes.
    pub(crate) fn item_taken(&self) {
        let _ = self
            .buffered_items
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.context.budget.release(1);
    }

    /// Fetches one page unless another fetch is in flight, the partition is
    /// exhausted, or (for demand) a page is already queued.
    ///
    /// Backend failures are not returned here; they are queued for the
    /// consumer. Only cancellation is returned as an error.
    pub async fn buffer_more(&self, mode: FetchMode, cancel: &CancellationToken) -> QueryResult<()> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            permit = self.gate.acquire() => {
                permit.map_err(|_| QueryError::internal("fetch gate closed"))?
            }
        };

        if matches!(mode, FetchMode::Demand) && self.queued_pages() > 0 {
            return Ok(());
        }

        let (continuation, page_size) = {
            let state = self.state();
            if !state.has_more() {
                return Ok(());
            }
            (
                state.continuation.clone(),
                self.context.page_sizing.page_size(state.successful_fetches),
            )
        };

        let reservation = match mode {
            FetchMode::Prefetch(reservation) => reservation,
            FetchMode::Demand => self.context.budget.reserve_demand(page_size, cancel).await?,
        };
        let request_size = reservation.amount().max(1);

        let started_at = Utc::now();
        let mut attempt: u32 = 0;

        loop {
            let request =
                self.context
                    .transport
                    .create_request(&self.target, continuation.as_deref(), request_size);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QueryError::Cancelled),
                outcome = self.context.transport.execute(request) => outcome,
            };

            match outcome {
                Ok(response) => {
                    self.accept(response, continuation, reservation, attempt, started_at)
                        .await;
                    return Ok(());
                }
                Err(e) if e.is_partition_split() => {
                    debug!(
                        event = %Event::PartitionSplitDetected,
                        partition = %self.target.range.id,
                        "backend reported range gone"
                    );
                    self.fail(e).await;
                    return Ok(());
                }
                Err(e) => match self.context.retry_policy.should_retry(&e, attempt) {
                    RetryDecision::Retry(backoff) => {
                        warn!(
                            event = %Event::FetchRetry,
                            partition = %self.target.range.id,
                            status = e.status,
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            "transient fetch failure"
                        );
                        attempt += 1;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    RetryDecision::Stop => {
                        error!(
                            event = %Event::FetchFailed,
                            partition = %self.target.range.id,
                            status = e.status,
                            sub_status = e.sub_status,
                            attempts = attempt + 1,
                            "fetch failed: {}",
                            e
                        );
                        self.fail(e).await;
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn accept(
        &self,
        response: QueryResponse,
        request_token: Option<String>,
        reservation: Reservation,
        retries: u32,
        started_at: chrono::DateTime<Utc>,
    ) {
        let item_count = response.items.len();
        reservation.commit(item_count);
        self.buffered_items.fetch_add(item_count, Ordering::SeqCst);
        self.context.charge.add_charge(response.request_charge);

        let has_more = response.continuation.is_some();
        // Counted as queued before the state drops its continuation.
        self.queued_pages.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state();
            state.continuation = response.continuation.clone();
            state.started = true;
            state.successful_fetches = state.successful_fetches.saturating_add(1);
        }

        debug!(
            event = %Event::PageFetched,
            partition = %self.target.range.id,
            items = item_count,
            charge = response.request_charge,
            has_more,
            "page fetched"
        );

        // Telemetry goes out before the page: a page never reaches the caller
        // ahead of its charge.
        let completion = FetchCompletion {
            partition_id: self.target.range.id.clone(),
            item_count,
            request_charge: response.request_charge,
            response_bytes: response.response_bytes,
            query_metrics: response.raw_query_metrics.as_deref().map(QueryMetrics::parse),
            execution_range: FetchExecutionRange {
                activity_id: response.activity_id.clone(),
                partition_id: self.target.range.id.clone(),
                start_time: started_at,
                end_time: Utc::now(),
                document_count: item_count,
                retry_count: retries,
            },
            has_more,
        };
        let _ = self.context.completions.send(completion);

        let page = Page {
            items: response.items,
            request_token,
            continuation: response.continuation,
            activity_id: response.activity_id,
            request_charge: response.request_charge,
        };

        // A closed receiver means the cursor is gone; nothing left to deliver to.
        let _ = self.pages.send(Ok(page)).await;
    }

    async fn fail(&self, error: BackendError) {
        self.queued_pages.fetch_add(1, Ordering::SeqCst);
        let _ = self.pages.send(Err(QueryError::Backend(error))).await;
        self.state().failed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::execution::{fetch_context, CrossPartitionParams};
    use crate::producer::PageSizing;
    use crate::query::QueryInfo;
    use crate::transport::memory::InMemoryBackend;
    use crate::transport::NoRetry;
    use serde_json::json;

    fn backend(documents: usize) -> Arc<InMemoryBackend> {
        let backend = InMemoryBackend::uniform(&["A", "B"]);
        for n in 0..documents {
            backend.insert("A", json!({"n": n})).unwrap();
        }
        Arc::new(backend)
    }

    fn fetcher(
        backend: &Arc<InMemoryBackend>,
        capacity: usize,
        page_size: usize,
    ) -> (
        Arc<PageFetcher>,
        mpsc::Receiver<PageResult>,
        mpsc::UnboundedReceiver<FetchCompletion>,
    ) {
        let params = CrossPartitionParams::new(
            ExecutionConfig::new(10).with_max_buffered_items(capacity),
            QueryInfo::default(),
            backend.target_ranges(),
            backend.clone(),
            backend.clone(),
            Arc::new(NoRetry),
        );
        let (context, completions) = fetch_context(&params, PageSizing::new(page_size, page_size));
        let target = RequestTarget {
            range: backend.target_ranges()[0].clone(),
            query: "SELECT * FROM c".to_string(),
            filter: None,
        };
        let (fetcher, pages) = PageFetcher::new(context, target, None);
        (fetcher, pages, completions)
    }

    #[tokio::test]
    async fn test_demand_skipped_while_page_queued() {
        let backend = backend(3);
        let (fetcher, _pages, _completions) = fetcher(&backend, 100, 1);
        let cancel = CancellationToken::new();

        let reservation = fetcher.context().budget.try_reserve_prefetch(1).unwrap();
        fetcher
            .buffer_more(FetchMode::Prefetch(reservation), &cancel)
            .await
            .unwrap();
        fetcher.buffer_more(FetchMode::Demand, &cancel).await.unwrap();

        assert_eq!(backend.request_count("0"), 1);
        assert_eq!(fetcher.queued_pages(), 1);
        assert_eq!(fetcher.buffered_items(), 1);
        assert_eq!(fetcher.context().budget.used(), 1);
    }

    #[tokio::test]
    async fn test_completion_precedes_page() {
        let backend = backend(3);
        let (fetcher, mut pages, mut completions) = fetcher(&backend, 100, 2);

        fetcher
            .buffer_more(FetchMode::Demand, &CancellationToken::new())
            .await
            .unwrap();

        let completion = completions.try_recv().unwrap();
        assert_eq!(completion.item_count, 2);
        assert!(completion.has_more);

        let page = pages.try_recv().unwrap().unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.request_token.is_none());
        assert_eq!(fetcher.successful_fetches(), 1);
        assert_eq!(fetcher.page_size(), 2);
    }

    #[tokio::test]
    async fn test_failure_queued_after_earlier_pages() {
        let backend = backend(3);
        let (fetcher, mut pages, _completions) = fetcher(&backend, 100, 1);
        let cancel = CancellationToken::new();

        fetcher.buffer_more(FetchMode::Demand, &cancel).await.unwrap();
        backend.inject_failure("0", BackendError::bad_request("bad query"));
        let reservation = fetcher.context().budget.try_reserve_prefetch(1).unwrap();
        fetcher
            .buffer_more(FetchMode::Prefetch(reservation), &cancel)
            .await
            .unwrap();

        assert!(pages.recv().await.unwrap().is_ok());
        assert!(matches!(pages.recv().await.unwrap(), Err(QueryError::Backend(_))));
        assert!(!fetcher.has_more_backend_results());
        // the failed fetch's reservation went back
        assert_eq!(fetcher.context().budget.used(), 1);
    }

    #[tokio::test]
    async fn test_demand_page_shrinks_to_budget() {
        let backend = backend(10);
        let (fetcher, _pages, _completions) = fetcher(&backend, 3, 10);

        fetcher
            .buffer_more(FetchMode::Demand, &CancellationToken::new())
            .await
            .unwrap();

        // three free: two for the page, one kept back
        assert_eq!(backend.requests()[0].page_size, 2);
        assert_eq!(fetcher.context().budget.used(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_returns_reservation() {
        let backend = backend(3);
        let (fetcher, _pages, _completions) = fetcher(&backend, 100, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let reservation = fetcher.context().budget.try_reserve_prefetch(2).unwrap();
        let result = fetcher.buffer_more(FetchMode::Prefetch(reservation), &cancel).await;

        assert!(matches!(result, Err(QueryError::Cancelled)));
        assert_eq!(fetcher.context().budget.used(), 0);
        assert!(backend.requests().is_empty());
        assert!(fetcher.has_more_backend_results());
    }
}
