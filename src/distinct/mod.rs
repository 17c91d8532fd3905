//! Distinct value tracking
//!
//! Used by the DISTINCT pipeline stage and by GROUP BY to key groups.

mod hash;
mod map;

pub use hash::DistinctHash;
pub use map::{DistinctMap, OrderedDistinctMap, UnorderedDistinctMap, UnorderedDistinctState};
