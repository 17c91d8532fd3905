//! Observability subsystem
//!
//! This module provides:
//! - Typed lifecycle events, logged through `tracing` as the `event` field
//! - Request charge tracking
//! - Backend and client-side query metrics
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on execution
//! 3. The library never installs a subscriber; binaries do
//!
//! # Usage
//!
//! ```ignore
//! use crossquery::observability::Event;
//!
//! tracing::info!(event = %Event::PageReturned, items = 10, "page returned");
//! ```

mod events;
mod metrics;

pub use events::Event;
pub use metrics::{
    ClientSideMetrics, FetchExecutionRange, PartitionedQueryMetrics, QueryMetrics,
    RequestChargeTracker,
};
