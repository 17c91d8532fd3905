//! Execution configuration
//!
//! Feed options and engine limits for one query execution. Loaded from a JSON
//! file (every field optional) or built in code; `validate` runs before any
//! network call is made.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{QueryError, QueryResult};

/// Capability flags for feature-gated query shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFeatures {
    /// OFFSET / LIMIT across partitions
    pub offset_limit: bool,
    /// GROUP BY across partitions
    pub group_by: bool,
}

impl Default for QueryFeatures {
    fn default() -> Self {
        Self {
            offset_limit: true,
            group_by: false,
        }
    }
}

impl QueryFeatures {
    pub fn all() -> Self {
        Self {
            offset_limit: true,
            group_by: true,
        }
    }

    pub fn none() -> Self {
        Self {
            offset_limit: false,
            group_by: false,
        }
    }
}

/// Retry limits for transient backend failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries per fetch before the error is surfaced (0 disables retry)
    pub max_attempts: u32,
    /// First backoff interval
    pub base_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 9,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }
}

/// Configuration for one cross-partition query execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum documents returned per `execute_next` call
    pub max_item_count: usize,

    /// Concurrent background fetches; 0 means one per partition
    pub max_degree_of_parallelism: usize,

    /// Upper bound on documents buffered client-side across all partitions
    pub max_buffered_item_count: usize,

    /// First backend page size; derived from `max_item_count` when absent
    pub initial_page_size: Option<usize>,

    /// Ceiling for the adaptive backend page size
    pub max_page_size: usize,

    /// Pages a single partition may hold before its fetcher waits
    pub page_queue_depth: usize,

    pub features: QueryFeatures,

    pub retry: RetryConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_item_count: 100,
            max_degree_of_parallelism: 0,
            max_buffered_item_count: 1_000,
            initial_page_size: None,
            max_page_size: 1_000,
            page_queue_depth: 8,
            features: QueryFeatures::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ExecutionConfig {
    /// Default configuration with the given caller page size
    pub fn new(max_item_count: usize) -> Self {
        Self {
            max_item_count,
            ..Self::default()
        }
    }

    pub fn with_parallelism(mut self, max_degree_of_parallelism: usize) -> Self {
        self.max_degree_of_parallelism = max_degree_of_parallelism;
        self
    }

    pub fn with_max_buffered_items(mut self, max_buffered_item_count: usize) -> Self {
        self.max_buffered_item_count = max_buffered_item_count;
        self
    }

    pub fn with_page_sizes(mut self, initial: usize, max: usize) -> Self {
        self.initial_page_size = Some(initial);
        self.max_page_size = max;
        self
    }

    pub fn with_features(mut self, features: QueryFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> QueryResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| QueryError::config(format!("Failed to read config: {}", e)))?;

        let config: ExecutionConfig = serde_json::from_str(&content)
            .map_err(|e| QueryError::config(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate limits
    pub fn validate(&self) -> QueryResult<()> {
        if self.max_item_count == 0 {
            return Err(QueryError::config("max_item_count must be > 0"));
        }

        if self.max_buffered_item_count == 0 {
            return Err(QueryError::config("max_buffered_item_count must be > 0"));
        }

        if self.max_page_size == 0 {
            return Err(QueryError::config("max_page_size must be > 0"));
        }

        if self.page_queue_depth == 0 {
            return Err(QueryError::config("page_queue_depth must be > 0"));
        }

        if let Some(initial) = self.initial_page_size {
            if initial == 0 || initial > self.max_page_size {
                return Err(QueryError::config(format!(
                    "initial_page_size must be in 1..={}, got {}",
                    self.max_page_size, initial
                )));
            }
        }

        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(QueryError::config(
                "retry.base_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }

        Ok(())
    }

    /// Background fetch concurrency for a query over `partitions` ranges
    pub fn effective_parallelism(&self, partitions: usize) -> usize {
        match self.max_degree_of_parallelism {
            0 => partitions.max(1),
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ExecutionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_item_count_rejected() {
        let config = ExecutionConfig::new(0);
        assert!(matches!(config.validate(), Err(QueryError::Config(_))));
    }

    #[test]
    fn test_initial_page_size_bounded_by_max() {
        let config = ExecutionConfig::new(10).with_page_sizes(50, 20);
        assert!(config.validate().is_err());

        let config = ExecutionConfig::new(10).with_page_sizes(5, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_parallelism() {
        assert_eq!(ExecutionConfig::default().effective_parallelism(7), 7);
        assert_eq!(ExecutionConfig::default().effective_parallelism(0), 1);
        assert_eq!(
            ExecutionConfig::default()
                .with_parallelism(2)
                .effective_parallelism(7),
            2
        );
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_item_count": 5, "features": {{"group_by": true}}}}"#).unwrap();

        let config = ExecutionConfig::load(file.path()).unwrap();
        assert_eq!(config.max_item_count, 5);
        assert_eq!(config.max_buffered_item_count, 1_000);
        assert!(config.features.group_by);
        assert!(config.features.offset_limit);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(ExecutionConfig::load(file.path()).is_err());
    }
}
