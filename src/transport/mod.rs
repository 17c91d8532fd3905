//! Transport subsystem
//!
//! The wire transport is an external collaborator: the engine only builds
//! [`QueryRequest`]s, hands them to a [`QueryTransport`] and classifies the
//! [`BackendError`]s that come back. Retry decisions belong to a
//! [`RetryPolicy`].
//!
//! [`memory::InMemoryBackend`] implements both the transport and the routing
//! collaborator over an in-process document set.

mod errors;
pub mod memory;
mod request;
mod retry;

pub use errors::{status, sub_status, BackendError};
pub use request::{QueryRequest, QueryResponse, RequestTarget};
pub use retry::{ExponentialRetryPolicy, NoRetry, RetryDecision, RetryPolicy};

use futures_util::future::BoxFuture;

/// Wire transport collaborator
pub trait QueryTransport: Send + Sync {
    /// Builds the request for the next page of `target`.
    fn create_request(
        &self,
        target: &RequestTarget,
        continuation: Option<&str>,
        page_size: usize,
    ) -> QueryRequest {
        QueryRequest::new(target, continuation, page_size)
    }

    /// Executes one page request.
    fn execute<'a>(
        &'a self,
        request: QueryRequest,
    ) -> BoxFuture<'a, Result<QueryResponse, BackendError>>;
}
