//! Routing subsystem
//!
//! Partition key ranges and the routing-map collaborator. The engine never
//! caches routing state itself; after a split it asks the provider for the
//! ranges that now cover the drained one.
//!
//! # Rules
//!
//! 1. Ranges returned by a provider exactly tile the keyspace
//! 2. Only splits are supported; a token whose range is not tiled by current
//!    ranges is rejected

mod range;
mod reconcile;

pub use range::{PartitionKeyRange, Range};
pub use reconcile::{
    find_target_range_and_extract_continuation_tokens, resolve_replacement_ranges,
    TargetRangeResolution,
};

use futures_util::future::BoxFuture;

use crate::errors::QueryResult;

/// Routing-map collaborator
pub trait RoutingMapProvider: Send + Sync {
    /// Current ranges overlapping `range`, sorted by `min_inclusive`.
    fn overlapping_ranges<'a>(
        &'a self,
        range: &'a Range,
    ) -> BoxFuture<'a, QueryResult<Vec<PartitionKeyRange>>>;
}
