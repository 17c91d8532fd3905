//! Observable query events
//!
//! Every log line the engine emits carries one of these as its `event`
//! field, so log consumers can filter on a stable name.

use std::fmt;

/// Observable events during query execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Query execution constructed
    QueryStart,
    /// Post-processing pipeline assembled
    PipelineBuilt,
    /// All results returned
    QueryComplete,
    /// Caller cancelled an in-progress page
    QueryCancelled,

    // Fetching
    /// One backend page fetched
    PageFetched,
    /// Transient backend failure, retrying
    FetchRetry,
    /// Backend failure delivered to the consumer
    FetchFailed,
    /// Demand fetch waiting for buffer space
    BufferWait,

    // Splits
    /// Backend reported a range as gone
    PartitionSplitDetected,
    /// Replacement ranges attached to the tree
    PartitionSplitResolved,

    // Continuations
    /// Execution resumed from a caller token
    ContinuationResumed,
    /// Caller token failed validation
    ContinuationRejected,

    // Caller surface
    /// Page handed to the caller
    PageReturned,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::QueryStart => "QUERY_START",
            Event::PipelineBuilt => "PIPELINE_BUILT",
            Event::QueryComplete => "QUERY_COMPLETE",
            Event::QueryCancelled => "QUERY_CANCELLED",

            Event::PageFetched => "PAGE_FETCHED",
            Event::FetchRetry => "FETCH_RETRY",
            Event::FetchFailed => "FETCH_FAILED",
            Event::BufferWait => "BUFFER_WAIT",

            Event::PartitionSplitDetected => "PARTITION_SPLIT_DETECTED",
            Event::PartitionSplitResolved => "PARTITION_SPLIT_RESOLVED",

            Event::ContinuationResumed => "CONTINUATION_RESUMED",
            Event::ContinuationRejected => "CONTINUATION_REJECTED",

            Event::PageReturned => "PAGE_RETURNED",
        }
    }

    /// Returns true if this event ends the query with an error
    pub fn is_failure(&self) -> bool {
        matches!(self, Event::FetchFailed | Event::ContinuationRejected)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_events_have_string_representation() {
        let events = [
            Event::QueryStart,
            Event::PipelineBuilt,
            Event::QueryComplete,
            Event::QueryCancelled,
            Event::PageFetched,
            Event::FetchRetry,
            Event::FetchFailed,
            Event::BufferWait,
            Event::PartitionSplitDetected,
            Event::PartitionSplitResolved,
            Event::ContinuationResumed,
            Event::ContinuationRejected,
            Event::PageReturned,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_failure_events() {
        assert!(Event::FetchFailed.is_failure());
        assert!(Event::ContinuationRejected.is_failure());
        assert!(!Event::PageReturned.is_failure());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::PartitionSplitDetected), "PARTITION_SPLIT_DETECTED");
    }
}
