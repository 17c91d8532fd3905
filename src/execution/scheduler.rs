//! Bounded prefetch scheduler
//!
//! A dispatcher task pulls prefetch requests off a channel into a priority
//! queue (lowest priority value first, then submission order) and runs at
//! most `max_concurrency` of them at a time.
//!
//! Each request runs under the token of the caller that submitted it.
//! Cancelling that token ends the fetch and returns its reservation; a
//! request still queued when its token fires is dropped unstarted.
//!
//! Dropping the scheduler stops the dispatcher; fetches still in flight are
//! aborted, not joined.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::producer::{FetchMode, PageFetcher, Reservation};

struct PrefetchRequest {
    priority: u64,
    seq: u64,
    fetcher: Arc<PageFetcher>,
    reservation: Reservation,
    cancel: CancellationToken,
}

impl PartialEq for PrefetchRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PrefetchRequest {}

impl PartialOrd for PrefetchRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrefetchRequest {
    // BinaryHeap is a max-heap; reverse so the smallest (priority, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

pub struct PrefetchScheduler {
    requests: mpsc::UnboundedSender<PrefetchRequest>,
    shutdown: CancellationToken,
    next_seq: u64,
}

impl PrefetchScheduler {
    /// Starts the dispatcher on the current runtime.
    pub fn start(max_concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(dispatch(rx, max_concurrency.max(1), shutdown.clone()));

        Self {
            requests: tx,
            shutdown,
            next_seq: 0,
        }
    }

    /// Queues one background fetch. The fetcher's prefetch slot must already
    /// be claimed; it is released when the fetch finishes.
    pub fn submit(
        &mut self,
        priority: u64,
        fetcher: Arc<PageFetcher>,
        reservation: Reservation,
        cancel: &CancellationToken,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let request = PrefetchRequest {
            priority,
            seq,
            fetcher,
            reservation,
            cancel: cancel.clone(),
        };
        if let Err(rejected) = self.requests.send(request) {
            rejected.0.fetcher.end_prefetch();
        }
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch(
    mut requests: mpsc::UnboundedReceiver<PrefetchRequest>,
    max_concurrency: usize,
    shutdown: CancellationToken,
) {
    let mut queue: BinaryHeap<PrefetchRequest> = BinaryHeap::new();
    let mut running = JoinSet::new();

    loop {
        while running.len() < max_concurrency {
            let Some(request) = queue.pop() else { break };
            if request.cancel.is_cancelled() {
                request.fetcher.end_prefetch();
                continue;
            }
            running.spawn(async move {
                let PrefetchRequest {
                    fetcher,
                    reservation,
                    priority,
                    cancel,
                    ..
                } = request;
                trace!(partition = %fetcher.range().id, priority, "prefetch started");
                // Backend failures are queued as pages; only cancellation is returned.
                let _ = fetcher
                    .buffer_more(FetchMode::Prefetch(reservation), &cancel)
                    .await;
                fetcher.end_prefetch();
            });
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => queue.push(request),
                None => break,
            },
            Some(_) = running.join_next(), if !running.is_empty() => {}
        }
    }

    running.abort_all();
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::config::ExecutionConfig;
    use crate::execution::{fetch_context, CrossPartitionParams};
    use crate::producer::{FetchContext, PageSizing};
    use crate::query::QueryInfo;
    use crate::transport::memory::InMemoryBackend;
    use crate::transport::{NoRetry, RequestTarget};

    fn backend(latency: Duration) -> Arc<InMemoryBackend> {
        let backend = InMemoryBackend::uniform(&["A", "B", "C", "D", "E"]).with_latency(latency);
        for key in ["A1", "B1", "C1", "D1"] {
            backend.insert(key, json!({"k": key})).unwrap();
        }
        Arc::new(backend)
    }

    fn fetchers(backend: &Arc<InMemoryBackend>) -> (Arc<FetchContext>, Vec<Arc<PageFetcher>>) {
        let params = CrossPartitionParams::new(
            ExecutionConfig::new(10),
            QueryInfo::default(),
            backend.target_ranges(),
            backend.clone(),
            backend.clone(),
            Arc::new(NoRetry),
        );
        let (context, _completions) = fetch_context(&params, PageSizing::new(1, 1));
        let fetchers = params
            .target_ranges
            .iter()
            .map(|range| {
                let target = RequestTarget {
                    range: range.clone(),
                    query: "SELECT * FROM c".to_string(),
                    filter: None,
                };
                let (fetcher, _pages) = PageFetcher::new(Arc::clone(&context), target, None);
                fetcher
            })
            .collect();
        (context, fetchers)
    }

    fn submit(
        scheduler: &mut PrefetchScheduler,
        context: &Arc<FetchContext>,
        fetcher: &Arc<PageFetcher>,
        priority: u64,
        cancel: &CancellationToken,
    ) {
        assert!(fetcher.begin_prefetch());
        let reservation = context.budget.try_reserve_prefetch(1).unwrap();
        scheduler.submit(priority, Arc::clone(fetcher), reservation, cancel);
    }

    #[tokio::test]
    async fn test_runs_at_most_max_concurrency() {
        let backend = backend(Duration::from_millis(100));
        let (context, fetchers) = fetchers(&backend);
        let cancel = CancellationToken::new();

        let mut scheduler = PrefetchScheduler::start(2);
        for fetcher in &fetchers {
            submit(&mut scheduler, &context, fetcher, 0, &cancel);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.requests().len(), 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_lower_priority_value_runs_first() {
        let backend = backend(Duration::from_millis(10));
        let (context, fetchers) = fetchers(&backend);
        let cancel = CancellationToken::new();

        let mut scheduler = PrefetchScheduler::start(1);
        for (fetcher, priority) in fetchers.iter().zip([5, 3, 1, 2]) {
            submit(&mut scheduler, &context, fetcher, priority, &cancel);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let order: Vec<String> = backend.requests().into_iter().map(|r| r.range.id).collect();
        // the first submission starts before the rest are queued
        assert_eq!(order, vec!["0", "2", "3", "1"]);
    }

    #[tokio::test]
    async fn test_caller_cancel_stops_running_fetch() {
        let backend = backend(Duration::from_secs(30));
        let (context, fetchers) = fetchers(&backend);
        let cancel = CancellationToken::new();

        let mut scheduler = PrefetchScheduler::start(4);
        submit(&mut scheduler, &context, &fetchers[0], 0, &cancel);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(context.budget.used(), 1);

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(context.budget.used(), 0);
        assert!(fetchers[0].wants_prefetch());
        assert_eq!(fetchers[0].queued_pages(), 0);
    }

    #[tokio::test]
    async fn test_request_cancelled_before_start_is_dropped() {
        let backend = backend(Duration::ZERO);
        let (context, fetchers) = fetchers(&backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut scheduler = PrefetchScheduler::start(1);
        submit(&mut scheduler, &context, &fetchers[0], 0, &cancel);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(backend.requests().is_empty());
        assert_eq!(context.budget.used(), 0);
        assert!(fetchers[0].wants_prefetch());
    }
}
