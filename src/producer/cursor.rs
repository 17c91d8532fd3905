//! Per-partition document cursor
//!
//! The consumer half of a partition: receives pages from its
//! [`PageFetcher`], walks them one document at a time and remembers enough
//! about its position to describe it in a continuation token.
//!
//! A cursor moves through three states: not started, positioned on a
//! document (served or not), and exhausted. A backend failure is sticky;
//! every later move returns it again.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::errors::{QueryError, QueryResult};
use crate::query::{ItemComparer, OrderByItem, OrderByQueryResult, ResourceId, SortOrder};
use crate::routing::PartitionKeyRange;
use crate::transport::RequestTarget;

use super::context::FetchContext;
use super::fetcher::{FetchMode, PageFetcher};
use super::page::{Page, PageResult};

/// ORDER BY position a resumed cursor skips forward to
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub order_by_items: Vec<OrderByItem>,
    pub document: u64,
    /// Identical documents (same rid and sort values) to skip after reaching the point
    pub skip_count: u64,
    pub orders: Arc<[SortOrder]>,
}

impl ResumePoint {
    /// Whether `item` was already returned before the continuation was taken.
    fn passes_over(&mut self, item: &Value) -> QueryResult<bool> {
        let result = OrderByQueryResult::from_value(item)?;
        let ordering = ItemComparer::compare_items(&result.order_by_items, &self.order_by_items, &self.orders);
        if ordering.is_ne() {
            return Ok(ordering.is_lt());
        }

        let document = ResourceId::parse(&result.rid)
            .ok_or_else(|| QueryError::unexpected_response(format!("unparsable rid '{}'", result.rid)))?
            .document();
        let primary = self.orders.first().copied().unwrap_or(SortOrder::Ascending);
        let ordering = primary.apply(document.cmp(&self.document));
        if ordering.is_ne() {
            return Ok(ordering.is_lt());
        }

        if self.skip_count > 0 {
            self.skip_count -= 1;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Document-at-a-time view over one partition key range
pub struct PartitionCursor {
    fetcher: Arc<PageFetcher>,
    pages: mpsc::Receiver<PageResult>,
    start_token: Option<String>,

    page_items: VecDeque<Value>,
    page_token: Option<String>,
    page_continuation: Option<String>,
    has_page: bool,

    current: Option<Value>,
    current_served: bool,
    duplicate_run: u64,
    served_any: bool,

    resume_point: Option<ResumePoint>,
    failure: Option<QueryError>,
    exhausted: bool,
}

impl PartitionCursor {
    pub fn new(context: Arc<FetchContext>, target: RequestTarget, start_token: Option<String>) -> Self {
        let (fetcher, pages) = PageFetcher::new(context, target, start_token.clone());
        Self {
            fetcher,
            pages,
            start_token,
            page_items: VecDeque::new(),
            page_token: None,
            page_continuation: None,
            has_page: false,
            current: None,
            current_served: false,
            duplicate_run: 0,
            served_any: false,
            resume_point: None,
            failure: None,
            exhausted: false,
        }
    }

    /// Skip documents up to `point` before positioning on the first one.
    pub fn with_resume_point(mut self, point: Option<ResumePoint>) -> Self {
        self.resume_point = point;
        self
    }

    pub fn fetcher(&self) -> &Arc<PageFetcher> {
        &self.fetcher
    }

    pub fn range(&self) -> &PartitionKeyRange {
        self.fetcher.range()
    }

    pub fn target(&self) -> &RequestTarget {
        self.fetcher.target()
    }

    /// Resume point not yet reached; inherited by split children.
    pub fn pending_resume_point(&self) -> Option<ResumePoint> {
        self.resume_point.clone()
    }

    /// The positioned document, unless it has already been served
    pub fn current(&self) -> Option<&Value> {
        match (&self.current, self.current_served) {
            (Some(item), false) => Some(item),
            _ => None,
        }
    }

    pub fn has_current(&self) -> bool {
        self.current().is_some()
    }

    /// Marks the current document as returned and hands it out.
    pub fn take_current(&mut self) -> Option<Value> {
        if self.current_served {
            return None;
        }
        let item = self.current.clone()?;
        self.current_served = true;
        self.served_any = true;
        Some(item)
    }

    /// Whether any document was returned from this cursor
    pub fn served_any(&self) -> bool {
        self.served_any
    }

    /// Documents identical to the current one earlier in its page
    pub fn duplicate_run(&self) -> u64 {
        self.duplicate_run
    }

    /// True once every document of the page in hand has been served
    pub fn page_drained(&self) -> bool {
        self.page_items.is_empty() && self.current().is_none()
    }

    /// Request token of the page holding the current document
    pub fn current_page_token(&self) -> Option<&str> {
        self.page_token.as_deref()
    }

    pub fn needs_advance(&self) -> bool {
        !self.is_exhausted() && self.current().is_none()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
            || (self.has_page
                && self.page_drained()
                && self.page_continuation.is_none()
                && self.failure.is_none())
    }

    /// Token to resume this partition at a page boundary; `None` for a
    /// cursor that has not received a page yet or is positioned at the
    /// start of one.
    pub fn boundary_token(&self) -> Option<&str> {
        if !self.has_page {
            return self.start_token.as_deref();
        }
        if self.current().is_some() || !self.page_items.is_empty() {
            return self.page_token.as_deref();
        }
        self.page_continuation.as_deref()
    }

    /// Advances to the next document; `false` once the partition is exhausted.
    pub async fn move_next(&mut self, cancel: &CancellationToken) -> QueryResult<bool> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if self.exhausted {
            return Ok(false);
        }

        loop {
            if !self.advance_within_page(cancel).await? {
                self.exhausted = true;
                self.current = None;
                return Ok(false);
            }

            let skip = match (&mut self.resume_point, &self.current) {
                (Some(point), Some(item)) => point.passes_over(item)?,
                _ => false,
            };
            if !skip {
                self.resume_point = None;
                return Ok(true);
            }
            self.current_served = true;
        }
    }

    async fn advance_within_page(&mut self, cancel: &CancellationToken) -> QueryResult<bool> {
        let previous = self.current.take();
        let mut same_page = true;

        loop {
            if let Some(item) = self.page_items.pop_front() {
                self.fetcher.item_taken();
                self.duplicate_run = match &previous {
                    Some(prev) if same_page && OrderByQueryResult::same_identity(prev, &item) => {
                        self.duplicate_run + 1
                    }
                    _ => 0,
                };
                self.current = Some(item);
                self.current_served = false;
                return Ok(true);
            }

            if self.has_page && self.page_continuation.is_none() {
                return Ok(false);
            }

            match self.next_page(cancel).await {
                Ok(Some(page)) => {
                    self.install(page);
                    same_page = false;
                }
                Ok(None) => return Ok(false),
                Err(QueryError::Cancelled) => return Err(QueryError::Cancelled),
                Err(e) => {
                    self.failure = Some(e.clone());
                    return Err(e);
                }
            }
        }
    }

    fn install(&mut self, page: Page) {
        self.page_items = page.items.into();
        self.page_token = page.request_token;
        self.page_continuation = page.continuation;
        self.has_page = true;
    }

    async fn next_page(&mut self, cancel: &CancellationToken) -> QueryResult<Option<Page>> {
        loop {
            match self.pages.try_recv() {
                Ok(page) => {
                    self.fetcher.page_received();
                    return page.map(Some);
                }
                Err(TryRecvError::Disconnected) => return Ok(None),
                Err(TryRecvError::Empty) => {}
            }

            if self.fetcher.queued_pages() > 0 {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(QueryError::Cancelled),
                    page = self.pages.recv() => page,
                };
                return match received {
                    Some(page) => {
                        self.fetcher.page_received();
                        page.map(Some)
                    }
                    None => Ok(None),
                };
            }

            if !self.fetcher.has_more_backend_results() {
                return Ok(None);
            }

            self.fetcher.buffer_more(FetchMode::Demand, cancel).await?;
        }
    }
}
