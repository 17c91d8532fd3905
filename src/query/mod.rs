//! Query description subsystem
//!
//! Everything the engine knows about a query comes from the compiler's
//! [`QueryInfo`]. This module also holds the ORDER BY value model shared by
//! the merge, the resume filters and the backends.
//!
//! # Rules
//!
//! 1. Undefined sorts below null, and null below every other value
//! 2. Resume filters are derived only from values the engine itself emitted

mod comparer;
mod filter;
mod info;
mod order_by;
mod rid;

pub use comparer::ItemComparer;
pub use filter::{resolve_path, FilterOp, Predicate, ResumeFilter};
pub use info::{format_query, AggregateOperator, DistinctType, QueryInfo, SortOrder, FILTER_PLACEHOLDER};
pub use order_by::{OrderByItem, OrderByQueryResult};
pub use rid::ResourceId;
