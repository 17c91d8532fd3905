//! Split-tolerant cursor tree
//!
//! A tree starts as a single cursor over one partition key range. When the
//! backend reports that range gone, the node is retired and one child cursor
//! per replacement range is appended, each resuming from the parent's last
//! backend continuation with the parent's filter. Nodes are never removed,
//! so indices stay valid for the life of the tree.
//!
//! # Invariants
//!
//! - Live leaves tile the root range
//! - After `ensure_current` succeeds, every live leaf is positioned on an
//!   unserved document and `current` is the leaf with the smallest key

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{QueryError, QueryResult};
use crate::observability::Event;
use crate::routing::{resolve_replacement_ranges, PartitionKeyRange};
use crate::transport::RequestTarget;

use super::context::FetchContext;
use super::cursor::PartitionCursor;

struct TreeNode {
    cursor: PartitionCursor,
    parent: Option<usize>,
    children: Vec<usize>,
    retired: bool,
}

pub struct PartitionCursorTree {
    nodes: Vec<TreeNode>,
    current: usize,
    context: Arc<FetchContext>,
}

impl PartitionCursorTree {
    pub fn new(context: Arc<FetchContext>, cursor: PartitionCursor) -> Self {
        Self {
            nodes: vec![TreeNode {
                cursor,
                parent: None,
                children: Vec::new(),
                retired: false,
            }],
            current: 0,
            context,
        }
    }

    /// The range this tree was created for
    pub fn root_range(&self) -> &PartitionKeyRange {
        self.nodes[0].cursor.range()
    }

    pub fn current_cursor(&self) -> &PartitionCursor {
        &self.nodes[self.current].cursor
    }

    pub fn current_cursor_mut(&mut self) -> &mut PartitionCursor {
        &mut self.nodes[self.current].cursor
    }

    /// Unserved document of the current leaf
    pub fn current_item(&self) -> Option<&serde_json::Value> {
        self.current_cursor().current()
    }

    pub fn take_current(&mut self) -> Option<serde_json::Value> {
        self.current_cursor_mut().take_current()
    }

    /// Number of nodes ever created, retired ones included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn split_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.retired).count()
    }

    fn is_leaf(node: &TreeNode) -> bool {
        !node.retired && node.children.is_empty()
    }

    /// Leaves that may still produce documents, in range order
    pub fn live_cursors(&self) -> Vec<&PartitionCursor> {
        let mut leaves: Vec<&PartitionCursor> = self
            .nodes
            .iter()
            .filter(|n| Self::is_leaf(n) && !n.cursor.is_exhausted())
            .map(|n| &n.cursor)
            .collect();
        leaves.sort_by(|a, b| a.range().min_inclusive.cmp(&b.range().min_inclusive));
        leaves
    }

    pub fn is_exhausted(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| !Self::is_leaf(n) || n.cursor.is_exhausted())
    }

    /// Positions every live leaf on an unserved document, recovering from
    /// splits on the way, then makes the leaf with the smallest `key`
    /// current. Returns `false` when the tree is exhausted.
    pub async fn ensure_current<K, F>(&mut self, cancel: &CancellationToken, key: F) -> QueryResult<bool>
    where
        K: Ord,
        F: Fn(&PartitionCursor) -> QueryResult<K>,
    {
        let mut worklist: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| Self::is_leaf(&self.nodes[i]) && self.nodes[i].cursor.needs_advance())
            .collect();

        while let Some(idx) = worklist.pop() {
            match self.nodes[idx].cursor.move_next(cancel).await {
                Ok(_) => {}
                Err(e) if e.is_partition_split() => {
                    let children = self.split(idx, cancel).await?;
                    worklist.extend(children);
                }
                Err(e) => return Err(e),
            }
        }

        let mut best: Option<(K, usize)> = None;
        for (idx, node) in self.nodes.iter().enumerate() {
            if !Self::is_leaf(node) || !node.cursor.has_current() {
                continue;
            }
            let k = key(&node.cursor)?;
            if best.as_ref().map_or(true, |(b, _)| k < *b) {
                best = Some((k, idx));
            }
        }

        match best {
            Some((_, idx)) => {
                self.current = idx;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Retires `idx` and appends one child per replacement range.
    async fn split(&mut self, idx: usize, cancel: &CancellationToken) -> QueryResult<Vec<usize>> {
        let parent = &self.nodes[idx].cursor;
        let drained = parent.range().clone();
        let continuation = parent.fetcher().backend_continuation();
        let resume_point = parent.pending_resume_point();
        let template = parent.target().clone();

        let replacements = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            r = resolve_replacement_ranges(self.context.routing.as_ref(), &drained) => r?,
        };

        let mut children = Vec::with_capacity(replacements.len());
        for range in replacements {
            let target = RequestTarget {
                range,
                query: template.query.clone(),
                filter: template.filter.clone(),
            };
            let cursor = PartitionCursor::new(Arc::clone(&self.context), target, continuation.clone())
                .with_resume_point(resume_point.clone());

            children.push(self.nodes.len());
            self.nodes.push(TreeNode {
                cursor,
                parent: Some(idx),
                children: Vec::new(),
                retired: false,
            });
        }

        let node = &mut self.nodes[idx];
        node.retired = true;
        node.children = children.clone();

        info!(
            event = %Event::PartitionSplitResolved,
            partition = %drained.id,
            children = ?children
                .iter()
                .map(|&c| self.nodes[c].cursor.range().id.as_str())
                .collect::<Vec<_>>(),
            depth = self.depth(idx),
            "partition split resolved"
        );

        Ok(children)
    }

    fn depth(&self, mut idx: usize) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.nodes[idx].parent {
            depth += 1;
            idx = parent;
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use crate::observability::RequestChargeTracker;
    use crate::producer::{BufferBudget, PageSizing};
    use crate::routing::{Range, RoutingMapProvider};
    use crate::transport::memory::InMemoryBackend;
    use crate::transport::NoRetry;

    /// Routing map that always answers with the same ranges
    struct FixedRouting(Vec<PartitionKeyRange>);

    impl RoutingMapProvider for FixedRouting {
        fn overlapping_ranges<'a>(&'a self, _range: &'a Range) -> BoxFuture<'a, QueryResult<Vec<PartitionKeyRange>>> {
            Box::pin(async move { Ok(self.0.clone()) })
        }
    }

    fn context(backend: &Arc<InMemoryBackend>, routing: Arc<dyn RoutingMapProvider>) -> Arc<FetchContext> {
        let (completions, _) = mpsc::unbounded_channel();
        Arc::new(FetchContext {
            transport: backend.clone(),
            routing,
            retry_policy: Arc::new(NoRetry),
            budget: BufferBudget::new(100),
            charge: Arc::new(RequestChargeTracker::new()),
            completions,
            page_sizing: PageSizing::new(1, 1),
            page_queue_depth: 2,
        })
    }

    fn tree(backend: &Arc<InMemoryBackend>, context: Arc<FetchContext>) -> PartitionCursorTree {
        let target = RequestTarget {
            range: backend.target_ranges()[0].clone(),
            query: "SELECT * FROM c".to_string(),
            filter: None,
        };
        let cursor = PartitionCursor::new(Arc::clone(&context), target, None);
        PartitionCursorTree::new(context, cursor)
    }

    fn by_range(cursor: &PartitionCursor) -> QueryResult<String> {
        Ok(cursor.range().min_inclusive.clone())
    }

    #[tokio::test]
    async fn test_split_appends_children() {
        let backend = Arc::new(InMemoryBackend::uniform(&["A", "C"]));
        backend.insert("A1", json!({"n": 1})).unwrap();
        backend.insert("B1", json!({"n": 2})).unwrap();
        backend.insert("A2", json!({"n": 3})).unwrap();
        backend.split_after("0", "B", 1);

        let routing: Arc<dyn RoutingMapProvider> = backend.clone();
        let mut tree = tree(&backend, context(&backend, routing));
        let cancel = CancellationToken::new();

        let mut seen = Vec::new();
        while tree.ensure_current(&cancel, by_range).await.unwrap() {
            let item: Value = tree.take_current().unwrap();
            seen.push(item["n"].as_i64().unwrap());
        }

        // the left child drains before the right one
        assert_eq!(seen, vec![1, 3, 2]);
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.split_count(), 1);
        assert_eq!(tree.root_range().id, "0");
        assert!(tree.is_exhausted());
        assert!(tree.live_cursors().is_empty());
    }

    #[tokio::test]
    async fn test_live_leaves_tile_root_after_split() {
        let backend = Arc::new(InMemoryBackend::uniform(&["A", "C"]));
        backend.insert("A1", json!({"n": 1})).unwrap();
        backend.insert("A2", json!({"n": 2})).unwrap();
        backend.insert("B1", json!({"n": 3})).unwrap();
        backend.insert("B2", json!({"n": 4})).unwrap();
        backend.split_after("0", "B", 1);

        let routing: Arc<dyn RoutingMapProvider> = backend.clone();
        let mut tree = tree(&backend, context(&backend, routing));
        let cancel = CancellationToken::new();

        assert!(tree.ensure_current(&cancel, by_range).await.unwrap());
        tree.take_current().unwrap();
        assert!(tree.ensure_current(&cancel, by_range).await.unwrap());

        let leaves: Vec<(String, String)> = tree
            .live_cursors()
            .iter()
            .map(|c| (c.range().min_inclusive.clone(), c.range().max_exclusive.clone()))
            .collect();
        assert_eq!(
            leaves,
            vec![("A".to_string(), "B".to_string()), ("B".to_string(), "C".to_string())]
        );
    }

    #[tokio::test]
    async fn test_replacements_must_tile_split_range() {
        let backend = Arc::new(InMemoryBackend::uniform(&["A", "C"]));
        backend.insert("A1", json!({"n": 1})).unwrap();
        backend.split_after("0", "B", 0);

        // covers only the left half of the gone range
        let routing = Arc::new(FixedRouting(vec![PartitionKeyRange::new("7", "A", "B")]));
        let mut tree = tree(&backend, context(&backend, routing));

        let err = tree
            .ensure_current(&CancellationToken::new(), by_range)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::RoutingInconsistency(_)), "{}", err);
        assert_eq!(tree.node_count(), 1);
    }
}
