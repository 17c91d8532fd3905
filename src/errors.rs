//! # Query Errors
//!
//! Every failure surfaced by the engine is a [`QueryError`]. Backend failures
//! keep their status/sub-status pair so callers can branch on them; everything
//! else carries a message only.

use thiserror::Error;

use crate::transport::BackendError;

/// Result type for query execution
pub type QueryResult<T> = Result<T, QueryError>;

/// Query execution errors
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    // ==================
    // Backend
    // ==================
    #[error("Backend request failed: {0}")]
    Backend(BackendError),

    // ==================
    // Continuation
    // ==================
    #[error("Malformed continuation token: {0}")]
    MalformedContinuation(String),

    // ==================
    // Routing
    // ==================
    #[error("Routing map inconsistency: {0}")]
    RoutingInconsistency(String),

    // ==================
    // Construction
    // ==================
    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    // ==================
    // Execution
    // ==================
    #[error("Query execution cancelled")]
    Cancelled,

    #[error("Unexpected backend response: {0}")]
    UnexpectedResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    pub fn malformed_continuation(msg: impl Into<String>) -> Self {
        QueryError::MalformedContinuation(msg.into())
    }

    pub fn routing_inconsistency(msg: impl Into<String>) -> Self {
        QueryError::RoutingInconsistency(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        QueryError::UnsupportedQuery(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        QueryError::Config(msg.into())
    }

    pub fn unexpected_response(msg: impl Into<String>) -> Self {
        QueryError::UnexpectedResponse(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        QueryError::Internal(msg.into())
    }

    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Backend(_) => "QUERY_BACKEND_FAILED",
            QueryError::MalformedContinuation(_) => "QUERY_MALFORMED_CONTINUATION",
            QueryError::RoutingInconsistency(_) => "QUERY_ROUTING_INCONSISTENCY",
            QueryError::UnsupportedQuery(_) => "QUERY_UNSUPPORTED",
            QueryError::FeatureDisabled(_) => "QUERY_FEATURE_DISABLED",
            QueryError::Config(_) => "QUERY_CONFIG_INVALID",
            QueryError::Cancelled => "QUERY_CANCELLED",
            QueryError::UnexpectedResponse(_) => "QUERY_UNEXPECTED_RESPONSE",
            QueryError::Serialization(_) => "QUERY_SERIALIZATION_FAILED",
            QueryError::Internal(_) => "QUERY_INTERNAL",
        }
    }

    /// HTTP-style status code
    pub fn status_code(&self) -> u16 {
        match self {
            QueryError::Backend(e) => e.status,
            QueryError::MalformedContinuation(_) => 400,
            QueryError::RoutingInconsistency(_) => 500,
            QueryError::UnsupportedQuery(_) => 400,
            QueryError::FeatureDisabled(_) => 400,
            QueryError::Config(_) => 400,
            QueryError::Cancelled => 499,
            QueryError::UnexpectedResponse(_) => 502,
            QueryError::Serialization(_) => 500,
            QueryError::Internal(_) => 500,
        }
    }

    /// Fatal errors cannot be cured by calling again with the same inputs.
    pub fn is_fatal(&self) -> bool {
        match self {
            QueryError::Backend(e) => !e.is_transient(),
            QueryError::Cancelled => false,
            _ => true,
        }
    }

    /// True when the backend reported the target range as gone due to a split.
    pub fn is_partition_split(&self) -> bool {
        matches!(self, QueryError::Backend(e) if e.is_partition_split())
    }
}

impl From<BackendError> for QueryError {
    fn from(e: BackendError) -> Self {
        QueryError::Backend(e)
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(QueryError::malformed_continuation("x").status_code(), 400);
        assert_eq!(QueryError::Cancelled.status_code(), 499);
        let throttled = QueryError::from(BackendError::throttled(None));
        assert_eq!(throttled.status_code(), 429);
    }

    #[test]
    fn test_fatality() {
        assert!(!QueryError::Cancelled.is_fatal());
        assert!(QueryError::routing_inconsistency("gap").is_fatal());
        assert!(!QueryError::from(BackendError::service_unavailable("busy")).is_fatal());
        assert!(QueryError::from(BackendError::bad_request("syntax")).is_fatal());
    }

    #[test]
    fn test_split_detection() {
        let err = QueryError::from(BackendError::partition_split("3"));
        assert!(err.is_partition_split());
        assert!(!QueryError::internal("x").is_partition_split());
    }

    #[test]
    fn test_display_includes_code_context() {
        let err = QueryError::malformed_continuation("empty token list");
        assert_eq!(err.code(), "QUERY_MALFORMED_CONTINUATION");
        assert!(err.to_string().contains("empty token list"));
    }
}
