//! Backend error classification

use std::fmt;
use std::time::Duration;

/// Status codes the engine reacts to
pub mod status {
    pub const BAD_REQUEST: u16 = 400;
    pub const REQUEST_TIMEOUT: u16 = 408;
    pub const GONE: u16 = 410;
    pub const TOO_MANY_REQUESTS: u16 = 429;
    pub const RETRY_WITH: u16 = 449;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// Sub-status codes qualifying [`status::GONE`]
pub mod sub_status {
    pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
    pub const COMPLETING_SPLIT: u32 = 1007;
    pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;
}

/// An error response from the backend (or a transport failure mapped onto one)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub status: u16,
    pub sub_status: u32,
    pub message: String,
    pub activity_id: Option<String>,
    pub retry_after: Option<Duration>,
}

impl BackendError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            sub_status: 0,
            message: message.into(),
            activity_id: None,
            retry_after: None,
        }
    }

    pub fn with_sub_status(mut self, sub_status: u32) -> Self {
        self.sub_status = sub_status;
        self
    }

    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// 410/1002: the range no longer exists because it was split
    pub fn partition_split(range_id: &str) -> Self {
        Self::new(
            status::GONE,
            format!("partition key range {} is gone", range_id),
        )
        .with_sub_status(sub_status::PARTITION_KEY_RANGE_GONE)
    }

    pub fn throttled(retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(status::TOO_MANY_REQUESTS, "request rate is too large")
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(status::SERVICE_UNAVAILABLE, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(status::BAD_REQUEST, message)
    }

    /// The range was split or is mid-split; routing must be refreshed.
    pub fn is_partition_split(&self) -> bool {
        self.status == status::GONE
            && matches!(
                self.sub_status,
                sub_status::PARTITION_KEY_RANGE_GONE
                    | sub_status::COMPLETING_SPLIT
                    | sub_status::COMPLETING_PARTITION_MIGRATION
            )
    }

    /// Worth retrying against the same range after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.status,
            status::REQUEST_TIMEOUT
                | status::TOO_MANY_REQUESTS
                | status::RETRY_WITH
                | status::SERVICE_UNAVAILABLE
        )
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.status, self.sub_status, self.message)?;
        if let Some(ref activity_id) = self.activity_id {
            write!(f, " (activity {})", activity_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for BackendError {}
