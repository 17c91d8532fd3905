//! crossquery - client-side cross-partition query execution
//!
//! Fans one query out over every partition key range it targets, merges the
//! per-partition pages (in range order, or by ORDER BY values), applies the
//! remaining client-side operators and hands back resumable pages.
//!
//! # Layout
//!
//! - `producer`: per-partition fetchers, cursors and split-tolerant trees
//! - `execution`: the forest of trees, merge policies and prefetch scheduling
//! - `pipeline`: aggregate, group by, distinct, offset and take stages plus
//!   the caller surface
//! - `transport` / `routing`: the backend and routing-map collaborators

pub mod cli;
pub mod config;
pub mod distinct;
pub mod errors;
pub mod execution;
pub mod observability;
pub mod pipeline;
pub mod producer;
pub mod query;
pub mod routing;
pub mod transport;

pub use config::{ExecutionConfig, QueryFeatures, RetryConfig};
pub use errors::{QueryError, QueryResult};
pub use execution::CrossPartitionParams;
pub use pipeline::{FeedPage, QueryExecution};
