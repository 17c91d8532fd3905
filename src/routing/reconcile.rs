//! Reconciling continuation ranges and split replacements against the
//! current routing map.
//!
//! Tokens and split children are never repaired: a range that is not tiled
//! exactly by current ranges is rejected.

use std::collections::HashMap;

use crate::errors::{QueryError, QueryResult};

use super::range::{PartitionKeyRange, Range};
use super::RoutingMapProvider;

/// Where a resumed query restarts, and which current ranges inherit which token
#[derive(Debug, Clone)]
pub struct TargetRangeResolution<T> {
    /// Index (into the current ranges) of the range the first token resumes
    pub target_index: usize,
    /// Current range id to the token that range inherits
    pub tokens: HashMap<String, T>,
}

/// Locates the resume target and maps every current range covered by a
/// supplied token to that token.
///
/// `ranges` must be sorted by `min_inclusive`. The first token picks the
/// target by exact `min_inclusive` match; every token's range must then be
/// tiled by current ranges with no gaps and matching outer boundaries.
pub fn find_target_range_and_extract_continuation_tokens<T: Clone>(
    ranges: &[PartitionKeyRange],
    supplied: &[(T, Range)],
) -> QueryResult<TargetRangeResolution<T>> {
    debug_assert!(
        ranges
            .windows(2)
            .all(|w| w[0].min_inclusive <= w[1].min_inclusive),
        "partition key ranges must be sorted by minInclusive"
    );

    let (_, first_range) = supplied
        .first()
        .ok_or_else(|| QueryError::malformed_continuation("continuation lists no ranges"))?;

    let target_index = ranges
        .binary_search_by(|r| r.min_inclusive.as_str().cmp(first_range.min.as_str()))
        .map_err(|_| {
            QueryError::malformed_continuation(format!(
                "no partition key range starts at '{}'",
                first_range.min
            ))
        })?;

    let mut tokens = HashMap::new();
    for (token, range) in supplied {
        if range.is_empty() {
            return Err(QueryError::malformed_continuation(format!(
                "empty range [{}, {})",
                range.min, range.max
            )));
        }

        let replacements: Vec<&PartitionKeyRange> =
            ranges.iter().filter(|r| r.overlaps(range)).collect();
        check_tiling(range, &replacements).map_err(QueryError::MalformedContinuation)?;

        for replacement in replacements {
            if tokens.insert(replacement.id.clone(), token.clone()).is_some() {
                return Err(QueryError::malformed_continuation(format!(
                    "range {} is covered by more than one token",
                    replacement.id
                )));
            }
        }
    }

    Ok(TargetRangeResolution {
        target_index,
        tokens,
    })
}

/// Asks the routing map for the children of a drained range and checks they
/// exactly replace it.
pub async fn resolve_replacement_ranges(
    routing: &dyn RoutingMapProvider,
    drained: &PartitionKeyRange,
) -> QueryResult<Vec<PartitionKeyRange>> {
    let range = drained.to_range();
    let mut replacements = routing.overlapping_ranges(&range).await?;
    replacements.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));

    if replacements.iter().any(|r| r.id == drained.id) {
        return Err(QueryError::routing_inconsistency(format!(
            "routing map still lists split range {}",
            drained.id
        )));
    }

    let refs: Vec<&PartitionKeyRange> = replacements.iter().collect();
    check_tiling(&range, &refs).map_err(QueryError::RoutingInconsistency)?;

    Ok(replacements)
}

/// `pieces` (sorted) must start at `range.min`, end at `range.max` and be contiguous.
fn check_tiling(range: &Range, pieces: &[&PartitionKeyRange]) -> Result<(), String> {
    let (first, last) = match (pieces.first(), pieces.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(format!(
                "no current range overlaps [{}, {})",
                range.min, range.max
            ))
        }
    };

    if first.min_inclusive != range.min || last.max_exclusive != range.max {
        return Err(format!(
            "ranges [{}, {}) do not match [{}, {})",
            first.min_inclusive, last.max_exclusive, range.min, range.max
        ));
    }

    for pair in pieces.windows(2) {
        if pair[0].max_exclusive != pair[1].min_inclusive {
            return Err(format!(
                "gap or overlap between ranges {} and {}",
                pair[0].id, pair[1].id
            ));
        }
    }

    Ok(())
}
