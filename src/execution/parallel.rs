//! Parallel (unordered) cross-partition drain
//!
//! Partitions drain strictly left to right by `min_inclusive`. Each drain
//! returns documents from one backend page only, so a drain always ends on
//! a page boundary and the `{token, range}` continuation is exact.
//!
//! Documents taken from a partition are held by the stage until a drain
//! returns them, so an interrupted drain loses nothing.

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::QueryResult;
use crate::observability::Event;
use crate::pipeline::QueryStage;
use crate::routing::find_target_range_and_extract_continuation_tokens;

use super::continuation::{parse_token_list, CompositeContinuationToken};
use super::forest::{ForestDiagnostics, PartitionForest, TreeSeed};
use super::policy::ParallelMerge;
use super::{fetch_context, CrossPartitionParams};
use crate::producer::PageSizing;
use crate::transport::RequestTarget;

pub struct ParallelCrossPartition {
    forest: PartitionForest<ParallelMerge>,
    taken: Vec<Value>,
}

impl ParallelCrossPartition {
    pub fn create(params: &CrossPartitionParams, continuation: Option<&Value>) -> QueryResult<Self> {
        let config = &params.config;
        let sizing = PageSizing::new(
            config.initial_page_size.unwrap_or(config.max_item_count),
            config.max_item_count,
        );
        let (context, completions) = fetch_context(params, sizing);

        let query = params.formatted_query(None);
        let target = |range| RequestTarget {
            range,
            query: query.clone(),
            filter: None,
        };

        let seeds: Vec<TreeSeed> = match continuation {
            None => params
                .target_ranges
                .iter()
                .map(|range| TreeSeed {
                    target: target(range.clone()),
                    continuation: None,
                    resume_point: None,
                })
                .collect(),
            Some(token) => {
                let tokens: Vec<CompositeContinuationToken> = parse_token_list(token)?;
                let supplied: Vec<(Option<String>, _)> =
                    tokens.into_iter().map(|t| (t.token, t.range)).collect();
                let resolution = find_target_range_and_extract_continuation_tokens(
                    &params.target_ranges,
                    &supplied,
                )?;

                info!(
                    event = %Event::ContinuationResumed,
                    target = %params.target_ranges[resolution.target_index].id,
                    ranges = supplied.len(),
                    "resuming parallel query"
                );

                params
                    .target_ranges
                    .iter()
                    .enumerate()
                    .filter_map(|(i, range)| match resolution.tokens.get(&range.id) {
                        Some(token) => Some((range, token.clone())),
                        None if i < resolution.target_index => None,
                        None => Some((range, None)),
                    })
                    .map(|(range, continuation)| TreeSeed {
                        target: target(range.clone()),
                        continuation,
                        resume_point: None,
                    })
                    .collect()
            }
        };

        let max_concurrency = config.effective_parallelism(seeds.len());
        let mut forest = PartitionForest::new(ParallelMerge, context, completions, seeds, max_concurrency);
        for idx in 0..forest.trees().len() {
            forest.enqueue(idx)?;
        }

        Ok(Self {
            forest,
            taken: Vec::new(),
        })
    }

    async fn drain_page(&mut self, max_items: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        self.forest.pump(cancel);

        while let Some(idx) = self.forest.peek() {
            if !self.taken.is_empty() && self.forest.tree(idx).current_cursor().page_drained() {
                break;
            }

            if !self.forest.ensure_tree(idx, cancel).await? {
                self.forest.retire(idx);
                continue;
            }

            loop {
                let tree = self.forest.tree_mut(idx);
                let Some(item) = tree.take_current() else { break };
                self.taken.push(item);

                if self.taken.len() >= max_items || tree.current_cursor().page_drained() {
                    break;
                }
                if !self.forest.ensure_tree(idx, cancel).await? {
                    break;
                }
            }

            if self.forest.tree(idx).is_exhausted() {
                self.forest.retire(idx);
            }
            break;
        }

        self.forest.pump(cancel);
        Ok(std::mem::take(&mut self.taken))
    }
}

impl QueryStage for ParallelCrossPartition {
    fn drain<'a>(
        &'a mut self,
        max_items: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, QueryResult<Vec<Value>>> {
        Box::pin(self.drain_page(max_items, cancel))
    }

    fn is_done(&self) -> bool {
        self.taken.is_empty() && self.forest.is_done()
    }

    /// `{token, range}` for every live leaf, left to right
    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        let tokens: Vec<CompositeContinuationToken> = self
            .forest
            .queued()
            .into_iter()
            .flat_map(|idx| self.forest.tree(idx).live_cursors())
            .map(|cursor| CompositeContinuationToken {
                token: cursor.boundary_token().map(str::to_string),
                range: cursor.range().to_range(),
            })
            .collect();

        if tokens.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_value(tokens)?))
    }

    fn take_diagnostics(&mut self) -> ForestDiagnostics {
        self.forest.take_diagnostics()
    }
}
