//! Partition producers
//!
//! One [`PartitionCursorTree`] per target range. Each leaf of a tree is a
//! [`PartitionCursor`] whose [`PageFetcher`] pulls pages from the transport,
//! either ahead of time through the prefetch scheduler or on demand.
//!
//! # Rules
//!
//! 1. At most one fetch per partition is in flight
//! 2. Pages of one partition are consumed in fetch order
//! 3. Every document buffered client-side is counted against the
//!    [`BufferBudget`]
//! 4. A split is invisible above the tree

mod budget;
mod context;
mod cursor;
mod fetcher;
mod page;
mod tree;

pub use budget::{BufferBudget, Reservation};
pub use context::{FetchContext, PageSizing};
pub use cursor::{PartitionCursor, ResumePoint};
pub use fetcher::{FetchMode, PageFetcher};
pub use page::{FetchCompletion, Page, PageResult};
pub use tree::PartitionCursorTree;
