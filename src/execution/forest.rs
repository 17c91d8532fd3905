//! Partition forest
//!
//! Owns one cursor tree per target range, a priority queue of the trees
//! that still have documents (ordered by the merge policy), the prefetch
//! scheduler and the telemetry collected from fetch completions.
//!
//! # Queue invariant
//!
//! A tree is queued under the key of its current leaf. Trees popped for
//! draining are parked in `stalled` until they are positioned again, so an
//! interrupted drain never loses a partition.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures_util::future::try_join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::QueryResult;
use crate::observability::{ClientSideMetrics, PartitionedQueryMetrics};
use crate::producer::{FetchCompletion, FetchContext, PartitionCursor, PartitionCursorTree, ResumePoint};
use crate::transport::RequestTarget;

use super::policy::MergePolicy;
use super::scheduler::PrefetchScheduler;

/// Where one tree starts
pub struct TreeSeed {
    pub target: RequestTarget,
    pub continuation: Option<String>,
    pub resume_point: Option<ResumePoint>,
}

/// Telemetry accumulated since the previous page was returned
#[derive(Debug, Clone, Default)]
pub struct ForestDiagnostics {
    pub request_charge: f64,
    pub partitioned_metrics: PartitionedQueryMetrics,
    pub client_metrics: ClientSideMetrics,
    pub activity_ids: Vec<String>,
}

impl ForestDiagnostics {
    pub fn merge(&mut self, other: ForestDiagnostics) {
        self.request_charge += other.request_charge;
        for (partition, metrics) in other.partitioned_metrics {
            *self.partitioned_metrics.entry(partition).or_default() += &metrics;
        }
        self.client_metrics.retries += other.client_metrics.retries;
        self.client_metrics.request_charge += other.client_metrics.request_charge;
        self.client_metrics
            .fetch_execution_ranges
            .extend(other.client_metrics.fetch_execution_ranges);
        self.client_metrics.buffered_items_high_water = self
            .client_metrics
            .buffered_items_high_water
            .max(other.client_metrics.buffered_items_high_water);
        self.activity_ids.extend(other.activity_ids);
    }
}

pub struct PartitionForest<P: MergePolicy> {
    policy: P,
    context: Arc<FetchContext>,
    trees: Vec<PartitionCursorTree>,
    queue: BinaryHeap<Reverse<(P::Key, usize)>>,
    stalled: Vec<usize>,
    scheduler: PrefetchScheduler,
    completions: mpsc::UnboundedReceiver<FetchCompletion>,
    telemetry: Vec<FetchCompletion>,
}

impl<P: MergePolicy> PartitionForest<P> {
    /// Builds one tree per seed, in seed order. Trees are not queued until
    /// [`enqueue`](Self::enqueue) or [`prime_all`](Self::prime_all).
    pub fn new(
        policy: P,
        context: Arc<FetchContext>,
        completions: mpsc::UnboundedReceiver<FetchCompletion>,
        seeds: Vec<TreeSeed>,
        max_concurrency: usize,
    ) -> Self {
        let trees = seeds
            .into_iter()
            .map(|seed| {
                let cursor = PartitionCursor::new(Arc::clone(&context), seed.target, seed.continuation)
                    .with_resume_point(seed.resume_point);
                PartitionCursorTree::new(Arc::clone(&context), cursor)
            })
            .collect();

        Self {
            policy,
            context,
            trees,
            queue: BinaryHeap::new(),
            stalled: Vec::new(),
            scheduler: PrefetchScheduler::start(max_concurrency),
            completions,
            telemetry: Vec::new(),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn trees(&self) -> &[PartitionCursorTree] {
        &self.trees
    }

    pub fn tree(&self, idx: usize) -> &PartitionCursorTree {
        &self.trees[idx]
    }

    pub fn tree_mut(&mut self, idx: usize) -> &mut PartitionCursorTree {
        &mut self.trees[idx]
    }

    pub fn is_done(&self) -> bool {
        self.queue.is_empty() && self.stalled.is_empty()
    }

    /// Queues a tree under the key of its current leaf.
    pub fn enqueue(&mut self, idx: usize) -> QueryResult<()> {
        let key = self.policy.key(self.trees[idx].current_cursor())?;
        self.stalled.retain(|&i| i != idx);
        self.queue.push(Reverse((key, idx)));
        Ok(())
    }

    /// Index of the tree that drains next
    pub fn peek(&self) -> Option<usize> {
        self.queue.peek().map(|Reverse((_, idx))| *idx)
    }

    /// Removes the head tree; it stays stalled until re-queued.
    pub fn pop(&mut self) -> Option<usize> {
        let Reverse((_, idx)) = self.queue.pop()?;
        self.stalled.push(idx);
        Some(idx)
    }

    /// Drops an exhausted tree.
    pub fn retire(&mut self, idx: usize) {
        self.queue.retain(|Reverse((_, i))| *i != idx);
        self.stalled.retain(|&i| i != idx);
    }

    /// Queued tree indices, head first
    pub fn queued(&self) -> Vec<usize> {
        let mut entries: Vec<&Reverse<(P::Key, usize)>> = self.queue.iter().collect();
        entries.sort();
        entries.into_iter().rev().map(|Reverse((_, idx))| *idx).collect()
    }

    /// Positions tree `idx`; `false` once it is exhausted.
    pub async fn ensure_tree(&mut self, idx: usize, cancel: &CancellationToken) -> QueryResult<bool> {
        let policy = &self.policy;
        self.trees[idx]
            .ensure_current(cancel, |cursor| policy.key(cursor))
            .await
    }

    /// Positions every tree concurrently and queues those with documents.
    pub async fn prime_all(&mut self, cancel: &CancellationToken) -> QueryResult<()> {
        let policy = &self.policy;
        let positioned = try_join_all(
            self.trees
                .iter_mut()
                .map(|tree| tree.ensure_current(cancel, move |cursor| policy.key(cursor))),
        )
        .await?;

        for (idx, has_items) in positioned.into_iter().enumerate() {
            if has_items {
                self.enqueue(idx)?;
            }
        }
        Ok(())
    }

    /// Re-positions trees left stalled by an interrupted drain.
    pub async fn recover_stalled(&mut self, cancel: &CancellationToken) -> QueryResult<()> {
        while let Some(&idx) = self.stalled.last() {
            if self.ensure_tree(idx, cancel).await? {
                self.enqueue(idx)?;
            } else {
                self.retire(idx);
            }
        }
        Ok(())
    }

    /// Collects finished fetches and schedules background fetches while the
    /// buffer budget allows. The fetches stop when `cancel` fires.
    pub fn pump(&mut self, cancel: &CancellationToken) {
        self.collect_completions();

        for (tree_idx, tree) in self.trees.iter().enumerate() {
            for cursor in tree.live_cursors() {
                let fetcher = cursor.fetcher();
                if !fetcher.wants_prefetch() {
                    continue;
                }
                let Some(reservation) = self.context.budget.try_reserve_prefetch(fetcher.page_size()) else {
                    trace!(
                        used = self.context.budget.used(),
                        capacity = self.context.budget.capacity(),
                        "prefetch admission closed"
                    );
                    return;
                };
                if !fetcher.begin_prefetch() {
                    continue;
                }
                let priority = self.policy.fetch_priority(tree_idx, cursor);
                self.scheduler
                    .submit(priority, Arc::clone(fetcher), reservation, cancel);
            }
        }
    }

    /// Most documents the query ever held client-side at once
    pub fn buffer_high_water(&self) -> usize {
        self.context.budget.high_water()
    }

    fn collect_completions(&mut self) {
        while let Ok(completion) = self.completions.try_recv() {
            self.telemetry.push(completion);
        }
    }

    /// Charge and metrics since the previous call, grouped by partition
    pub fn take_diagnostics(&mut self) -> ForestDiagnostics {
        self.collect_completions();

        let mut diagnostics = ForestDiagnostics {
            request_charge: self.context.charge.get_and_reset_charge(),
            ..ForestDiagnostics::default()
        };
        diagnostics.client_metrics.buffered_items_high_water = self.buffer_high_water();

        for completion in self.telemetry.drain(..) {
            let metrics = diagnostics
                .partitioned_metrics
                .entry(completion.partition_id.clone())
                .or_default();
            if let Some(query_metrics) = &completion.query_metrics {
                *metrics += query_metrics;
            }
            diagnostics
                .activity_ids
                .push(completion.execution_range.activity_id.clone());
            diagnostics
                .client_metrics
                .record_fetch(completion.execution_range, completion.request_charge);
        }

        diagnostics
    }
}
