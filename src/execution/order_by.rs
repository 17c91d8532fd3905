//! ORDER BY cross-partition merge
//!
//! Every partition returns its documents sorted, so a k-way merge over the
//! current document of each partition yields the global order. Equal sort
//! values are ordered by document id in the primary direction, in every
//! partition and across them.
//!
//! # Resume
//!
//! The first token names the partition holding the next document (the
//! target). Other tokens name partitions that already returned documents
//! and still have more. Named partitions replay their page under their
//! recorded filter and skip forward to their recorded document. Partitions
//! not named restart under a filter inclusive of the target's sort values
//! and skip the documents that sort before the target document.
//!
//! Documents taken from the merge are held by the stage until a drain
//! returns them, so a drain interrupted by cancellation or a fetch failure
//! hands them out on the next call.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{QueryError, QueryResult};
use crate::observability::Event;
use crate::pipeline::QueryStage;
use crate::producer::{PageSizing, PartitionCursor, ResumePoint};
use crate::query::{OrderByQueryResult, ResumeFilter, SortOrder};
use crate::routing::find_target_range_and_extract_continuation_tokens;
use crate::transport::RequestTarget;

use super::continuation::{parse_token_list, CompositeContinuationToken, OrderByContinuationToken};
use super::forest::{ForestDiagnostics, PartitionForest, TreeSeed};
use super::policy::OrderByMerge;
use super::{fetch_context, CrossPartitionParams};

pub struct OrderByCrossPartition {
    forest: PartitionForest<OrderByMerge>,
    taken: Vec<Value>,
}

impl OrderByCrossPartition {
    pub async fn create(
        params: &CrossPartitionParams,
        continuation: Option<&Value>,
        cancel: &CancellationToken,
    ) -> QueryResult<Self> {
        let config = &params.config;
        let info = &params.query_info;
        let orders: Arc<[SortOrder]> = Arc::from(info.order_by.clone());

        let partitions = params.target_ranges.len().max(1);
        let sizing = PageSizing::new(
            config
                .initial_page_size
                .unwrap_or_else(|| config.max_item_count.div_ceil(partitions)),
            config.max_page_size,
        );
        let (context, completions) = fetch_context(params, sizing);

        let target = |range, filter: Option<String>| RequestTarget {
            range,
            query: params.formatted_query(filter.as_deref()),
            filter,
        };

        let seeds: Vec<TreeSeed> = match continuation {
            None => params
                .target_ranges
                .iter()
                .map(|range| TreeSeed {
                    target: target(range.clone(), None),
                    continuation: None,
                    resume_point: None,
                })
                .collect(),
            Some(token) => {
                let tokens: Vec<OrderByContinuationToken> = parse_token_list(token)?;
                let mut documents = Vec::with_capacity(tokens.len());
                for token in &tokens {
                    documents.push(token.validate(orders.len())?);
                }

                let supplied: Vec<(usize, _)> = tokens
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (i, t.composite_token.range.clone()))
                    .collect();
                let resolution = find_target_range_and_extract_continuation_tokens(
                    &params.target_ranges,
                    &supplied,
                )?;

                info!(
                    event = %Event::ContinuationResumed,
                    target = %params.target_ranges[resolution.target_index].id,
                    ranges = tokens.len(),
                    "resuming order-by query"
                );

                let resume_filter = ResumeFilter::build(
                    &info.order_by_expressions,
                    &orders,
                    &tokens[0].order_by_items,
                )?;
                let resume_filter = (!resume_filter.is_match_all()).then(|| resume_filter.to_string());
                let head_point = ResumePoint {
                    order_by_items: tokens[0].order_by_items.clone(),
                    document: documents[0],
                    skip_count: 0,
                    orders: Arc::clone(&orders),
                };

                let mut seeds = Vec::with_capacity(params.target_ranges.len());
                for range in &params.target_ranges {
                    let seed = match resolution.tokens.get(&range.id) {
                        Some(&t) => {
                            let token = &tokens[t];
                            let filter = (token.filter != "true").then(|| token.filter.clone());
                            TreeSeed {
                                target: target(range.clone(), filter),
                                continuation: token.composite_token.token.clone(),
                                resume_point: Some(ResumePoint {
                                    order_by_items: token.order_by_items.clone(),
                                    document: documents[t],
                                    skip_count: token.skip_count,
                                    orders: Arc::clone(&orders),
                                }),
                            }
                        }
                        None => TreeSeed {
                            target: target(range.clone(), resume_filter.clone()),
                            continuation: None,
                            resume_point: Some(head_point.clone()),
                        },
                    };
                    seeds.push(seed);
                }
                seeds
            }
        };

        let max_concurrency = config.effective_parallelism(seeds.len());
        let mut forest = PartitionForest::new(
            OrderByMerge::new(orders),
            context,
            completions,
            seeds,
            max_concurrency,
        );
        forest.prime_all(cancel).await?;

        Ok(Self {
            forest,
            taken: Vec::new(),
        })
    }

    async fn drain_merged(&mut self, max_items: usize, cancel: &CancellationToken) -> QueryResult<Vec<Value>> {
        self.forest.recover_stalled(cancel).await?;
        self.forest.pump(cancel);

        while self.taken.len() < max_items {
            let Some(idx) = self.forest.pop() else { break };

            let raw = self
                .forest
                .tree_mut(idx)
                .take_current()
                .ok_or_else(|| QueryError::internal("queued partition without a current document"))?;
            self.taken.push(OrderByQueryResult::from_value(&raw)?.payload);

            if self.forest.ensure_tree(idx, cancel).await? {
                self.forest.enqueue(idx)?;
            } else {
                self.forest.retire(idx);
            }
        }

        self.forest.pump(cancel);
        Ok(std::mem::take(&mut self.taken))
    }

    fn token_for(cursor: &PartitionCursor) -> QueryResult<OrderByContinuationToken> {
        let item = cursor
            .current()
            .ok_or_else(|| QueryError::internal("continuation for an unpositioned cursor"))?;
        let result = OrderByQueryResult::from_value(item)?;

        Ok(OrderByContinuationToken {
            composite_token: CompositeContinuationToken {
                token: cursor.current_page_token().map(str::to_string),
                range: cursor.range().to_range(),
            },
            order_by_items: result.order_by_items,
            rid: result.rid,
            skip_count: cursor.duplicate_run(),
            filter: cursor
                .target()
                .filter
                .clone()
                .unwrap_or_else(|| "true".to_string()),
        })
    }
}

impl QueryStage for OrderByCrossPartition {
    fn drain<'a>(
        &'a mut self,
        max_items: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, QueryResult<Vec<Value>>> {
        Box::pin(self.drain_merged(max_items, cancel))
    }

    fn is_done(&self) -> bool {
        self.taken.is_empty() && self.forest.is_done()
    }

    /// Head partition first, then every other partition that has returned
    /// documents and still has more, left to right.
    fn continuation_token(&self) -> QueryResult<Option<Value>> {
        let Some(head_idx) = self.forest.peek() else {
            return Ok(None);
        };
        let head = self.forest.tree(head_idx).current_cursor();

        let mut active: Vec<&PartitionCursor> = self
            .forest
            .queued()
            .into_iter()
            .flat_map(|idx| self.forest.tree(idx).live_cursors())
            .filter(|cursor| {
                cursor.served_any() && cursor.has_current() && !std::ptr::eq(*cursor, head)
            })
            .collect();
        active.sort_by(|a, b| a.range().min_inclusive.cmp(&b.range().min_inclusive));

        let mut tokens = vec![Self::token_for(head)?];
        for cursor in active {
            tokens.push(Self::token_for(cursor)?);
        }

        Ok(Some(serde_json::to_value(tokens)?))
    }

    fn take_diagnostics(&mut self) -> ForestDiagnostics {
        self.forest.take_diagnostics()
    }
}
