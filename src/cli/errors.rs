//! Errors of the `crossquery` command
//!
//! Each failure is reported on stdout as a JSON line carrying a stable code,
//! so scripts driving a fixture run can tell a bad fixture from a rejected
//! continuation or a backend failure without parsing the message.

use std::fmt;
use std::io;

use crate::errors::QueryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Execution config unreadable or out of bounds
    ConfigError,
    /// Fixture file missing, not JSON, or listing no ranges
    FixtureError,
    /// `--continuation` is not a token this query can resume from
    ContinuationRejected,
    /// Writing results failed
    IoError,
    /// The query started but a page could not be produced
    QueryFailed,
}

impl CliErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "CROSSQUERY_CLI_CONFIG_ERROR",
            Self::FixtureError => "CROSSQUERY_CLI_FIXTURE_ERROR",
            Self::ContinuationRejected => "CROSSQUERY_CLI_CONTINUATION_REJECTED",
            Self::IoError => "CROSSQUERY_CLI_IO_ERROR",
            Self::QueryFailed => "CROSSQUERY_CLI_QUERY_FAILED",
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn fixture_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::FixtureError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Stable code written in the JSON error line
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<QueryError> for CliError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Config(msg) => Self::config_error(msg),
            QueryError::MalformedContinuation(msg) => Self::new(CliErrorCode::ContinuationRejected, msg),
            other => Self::new(
                CliErrorCode::QueryFailed,
                format!("{} ({})", other, other.code()),
            ),
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_mapping() {
        let err: CliError = QueryError::config("max_item_count must be > 0").into();
        assert_eq!(err.code(), &CliErrorCode::ConfigError);

        let err: CliError = QueryError::malformed_continuation("not JSON").into();
        assert_eq!(err.code(), &CliErrorCode::ContinuationRejected);
        assert_eq!(err.message(), "not JSON");

        let err: CliError = QueryError::Cancelled.into();
        assert_eq!(err.code(), &CliErrorCode::QueryFailed);
        assert!(err.message().contains("QUERY_CANCELLED"), "{}", err.message());
    }
}
