//! Partition Split Tests
//!
//! Splits are recovered below the merge:
//! - A range split mid-drain changes neither the documents nor their order
//! - Continuations taken before or after a split resume exactly
//! - Tokens name the child ranges once a split was seen

use std::sync::Arc;

use crossquery::execution::CrossPartitionParams;
use crossquery::pipeline::{FeedPage, QueryExecution};
use crossquery::query::{QueryInfo, SortOrder, FILTER_PLACEHOLDER};
use crossquery::transport::memory::InMemoryBackend;
use crossquery::transport::NoRetry;
use crossquery::ExecutionConfig;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Helper Functions
// =============================================================================

/// (partition key, label, sort value)
const DOCS: [(&str, i64, i64); 10] = [
    ("A1", 1, 40),
    ("B1", 2, 10),
    ("B2", 3, 70),
    ("B5", 4, 20),
    ("C1", 5, 50),
    ("B3", 6, 30),
    ("B7", 7, 80),
    ("B6", 8, 60),
    ("A2", 9, 90),
    ("B8", 10, 0),
];

fn backend(ordered: bool) -> Arc<InMemoryBackend> {
    let mut backend = InMemoryBackend::uniform(&["A", "B", "C", "D"]);
    if ordered {
        backend = backend.with_order_by(vec!["c.v".to_string()], vec![SortOrder::Ascending]);
    }
    for (pk, n, v) in DOCS {
        backend.insert(pk, json!({"pk": pk, "n": n, "v": v})).unwrap();
    }
    Arc::new(backend)
}

fn query_info(ordered: bool) -> QueryInfo {
    if ordered {
        QueryInfo {
            order_by: vec![SortOrder::Ascending],
            order_by_expressions: vec!["c.v".to_string()],
            rewritten_query: format!("SELECT * FROM c WHERE {} ORDER BY c.v", FILTER_PLACEHOLDER),
            ..QueryInfo::default()
        }
    } else {
        QueryInfo {
            rewritten_query: "SELECT * FROM c".to_string(),
            ..QueryInfo::default()
        }
    }
}

async fn drain(
    backend: &Arc<InMemoryBackend>,
    ordered: bool,
    max_item_count: usize,
    continuation: Option<&str>,
) -> Vec<FeedPage> {
    let cancel = CancellationToken::new();
    let params = CrossPartitionParams::new(
        ExecutionConfig::new(max_item_count),
        query_info(ordered),
        backend.target_ranges(),
        backend.clone(),
        backend.clone(),
        Arc::new(NoRetry),
    );
    let mut execution = QueryExecution::create(params, continuation, &cancel).await.unwrap();

    let mut pages = Vec::new();
    loop {
        let page = execution.execute_next(&cancel).await.unwrap();
        let last = page.continuation.is_none();
        pages.push(page);
        if last {
            break;
        }
    }
    pages
}

fn labels(pages: &[FeedPage]) -> Vec<i64> {
    pages
        .iter()
        .flat_map(|p| p.items.iter())
        .map(|item| item["n"].as_i64().unwrap())
        .collect()
}

/// ORDER BY results must match exactly; parallel results only as a
/// multiset, since a split range drains its children one after the other.
fn assert_same_results(ordered: bool, mut got: Vec<i64>, mut want: Vec<i64>, context: &str) {
    if !ordered {
        got.sort_unstable();
        want.sort_unstable();
    }
    assert_eq!(got, want, "{}", context);
}

fn token_ranges(token: &str) -> Vec<(String, String)> {
    let token: Value = serde_json::from_str(token).unwrap();
    token
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| {
            let range = entry.get("range").unwrap_or(&entry["compositeToken"]["range"]);
            (
                range["min"].as_str().unwrap().to_string(),
                range["max"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

// =============================================================================
// Mid-Drain Split Tests
// =============================================================================

/// Parallel drain: a split after the first page of a range loses and
/// repeats nothing.
#[tokio::test]
async fn test_parallel_split_mid_drain() {
    let reference = labels(&drain(&backend(false), false, 2, None).await);

    let backend = backend(false);
    backend.split_after("1", "B4", 1);
    let pages = drain(&backend, false, 2, None).await;

    assert_same_results(false, labels(&pages), reference, "split mid drain");
    assert_eq!(backend.target_ranges().len(), 4);
    assert!(backend.request_count("3") > 0);
    assert!(backend.request_count("4") > 0);
}

/// ORDER BY drain: a split keeps the global order.
#[tokio::test]
async fn test_order_by_split_mid_drain() {
    let reference = labels(&drain(&backend(true), true, 3, None).await);
    assert_eq!(reference, vec![10, 2, 4, 6, 1, 5, 8, 3, 7, 9]);

    let backend = backend(true);
    backend.split_after("1", "B4", 1);
    let pages = drain(&backend, true, 3, None).await;

    assert_eq!(labels(&pages), reference);
}

/// A split on the very first request of a range.
#[tokio::test]
async fn test_split_before_first_page() {
    let reference = labels(&drain(&backend(false), false, 3, None).await);

    let backend = backend(false);
    backend.split_after("1", "B4", 0);
    let pages = drain(&backend, false, 3, None).await;

    assert_same_results(false, labels(&pages), reference, "split on first request");
}

/// Children of a split child are followed as well.
#[tokio::test]
async fn test_nested_split() {
    let reference = labels(&drain(&backend(true), true, 2, None).await);

    let backend = backend(true);
    backend.split_after("1", "B4", 1);
    // "3" is the left child [B, B4)
    backend.split_after("3", "B2", 1);
    let pages = drain(&backend, true, 2, None).await;

    assert_eq!(labels(&pages), reference);
    assert_eq!(backend.target_ranges().len(), 5);
}

// =============================================================================
// Resume Across Split Tests
// =============================================================================

/// Continuations recorded while a split happens name the children and
/// resume exactly.
#[tokio::test]
async fn test_resume_after_split_seen() {
    for ordered in [false, true] {
        let backend = backend(ordered);
        backend.split_after("1", "B4", 1);
        let pages = drain(&backend, ordered, 1, None).await;
        let all = labels(&pages);

        let mut consumed = 0;
        let mut saw_child = false;
        for page in &pages {
            consumed += page.items.len();
            let Some(token) = &page.continuation else { continue };
            saw_child |= token_ranges(token)
                .iter()
                .any(|(min, max)| matches!((min.as_str(), max.as_str()), ("B", "B4") | ("B4", "C")));

            let rest = drain(&backend, ordered, 1, Some(token)).await;
            assert_same_results(
                ordered,
                labels(&rest),
                all[consumed..].to_vec(),
                &format!("ordered={} after {}", ordered, consumed),
            );
        }
        assert!(saw_child, "ordered={}", ordered);
    }
}

/// A continuation naming a range that has since split resumes against
/// both children.
#[tokio::test]
async fn test_resume_token_from_before_split() {
    for ordered in [false, true] {
        let backend = backend(ordered);
        let pages = drain(&backend, ordered, 2, None).await;
        let all = labels(&pages);

        // first page whose token names [B, C)
        let (consumed, token) = pages
            .iter()
            .scan(0, |consumed, page| {
                *consumed += page.items.len();
                Some((*consumed, page.continuation.clone()))
            })
            .find_map(|(consumed, token)| {
                let token = token?;
                token_ranges(&token)
                    .iter()
                    .any(|(min, _)| min == "B")
                    .then_some((consumed, token))
            })
            .unwrap();

        backend.split("1", "B4").unwrap();
        let rest = drain(&backend, ordered, 2, Some(&token)).await;

        assert_same_results(
            ordered,
            labels(&rest),
            all[consumed..].to_vec(),
            &format!("ordered={}", ordered),
        );
    }
}
