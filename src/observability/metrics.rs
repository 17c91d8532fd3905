//! Query metrics
//!
//! - Request charge is accumulated across concurrent fetches and reset each
//!   time a page is handed to the caller
//! - Backend metrics arrive as `key=value;...` strings and are summed per
//!   partition
//! - Client-side metrics record retries and per-fetch timing

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Charge is tracked in hundredths so it fits an atomic integer.
const CHARGE_SCALE: f64 = 100.0;

/// Request charge accumulator shared by every fetch of one query
///
/// # Thread Safety
///
/// Uses Relaxed ordering; the value is only read when a page is returned.
#[derive(Debug, Default)]
pub struct RequestChargeTracker {
    units: AtomicU64,
}

impl RequestChargeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the charge of one response
    pub fn add_charge(&self, charge: f64) {
        let units = (charge.max(0.0) * CHARGE_SCALE).round() as u64;
        self.units.fetch_add(units, Ordering::Relaxed);
    }

    /// Returns the charge accumulated since the last call and resets it
    pub fn get_and_reset_charge(&self) -> f64 {
        self.units.swap(0, Ordering::Relaxed) as f64 / CHARGE_SCALE
    }

    /// Charge accumulated since the last reset
    pub fn current(&self) -> f64 {
        self.units.load(Ordering::Relaxed) as f64 / CHARGE_SCALE
    }
}

/// Backend query metrics for one or more pages
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetrics {
    pub retrieved_document_count: u64,
    pub retrieved_document_size: u64,
    pub output_document_count: u64,
    pub output_document_size: u64,
    /// Fraction of retrieved documents that matched through the index
    pub index_hit_ratio: f64,
    pub total_execution_time_ms: f64,
    pub query_compile_time_ms: f64,
    pub logical_plan_build_time_ms: f64,
    pub physical_plan_build_time_ms: f64,
    pub query_optimization_time_ms: f64,
    pub index_lookup_time_ms: f64,
    pub document_load_time_ms: f64,
    pub vm_execution_time_ms: f64,
    pub system_function_execution_time_ms: f64,
    pub user_function_execution_time_ms: f64,
    pub document_write_time_ms: f64,
}

impl QueryMetrics {
    /// Parses a backend metrics string. Unknown keys and unparsable values
    /// are ignored.
    pub fn parse(raw: &str) -> Self {
        let mut metrics = Self::default();

        for pair in raw.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let Ok(value) = value.trim().parse::<f64>() else {
                continue;
            };

            match key.trim() {
                "retrievedDocumentCount" => metrics.retrieved_document_count = value as u64,
                "retrievedDocumentSize" => metrics.retrieved_document_size = value as u64,
                "outputDocumentCount" => metrics.output_document_count = value as u64,
                "outputDocumentSize" => metrics.output_document_size = value as u64,
                "indexUtilizationRatio" => metrics.index_hit_ratio = value,
                "totalExecutionTimeInMs" => metrics.total_execution_time_ms = value,
                "queryCompileTimeInMs" => metrics.query_compile_time_ms = value,
                "queryLogicalPlanBuildTimeInMs" => metrics.logical_plan_build_time_ms = value,
                "queryPhysicalPlanBuildTimeInMs" => metrics.physical_plan_build_time_ms = value,
                "queryOptimizationTimeInMs" => metrics.query_optimization_time_ms = value,
                "indexLookupTimeInMs" => metrics.index_lookup_time_ms = value,
                "documentLoadTimeInMs" => metrics.document_load_time_ms = value,
                "VMExecutionTimeInMs" => metrics.vm_execution_time_ms = value,
                "systemFunctionExecuteTimeInMs" => metrics.system_function_execution_time_ms = value,
                "userFunctionExecuteTimeInMs" => metrics.user_function_execution_time_ms = value,
                "writeOutputTimeInMs" => metrics.document_write_time_ms = value,
                _ => {}
            }
        }

        metrics
    }
}

impl AddAssign<&QueryMetrics> for QueryMetrics {
    fn add_assign(&mut self, other: &QueryMetrics) {
        let retrieved = self.retrieved_document_count + other.retrieved_document_count;
        self.index_hit_ratio = if retrieved == 0 {
            0.0
        } else {
            (self.index_hit_ratio * self.retrieved_document_count as f64
                + other.index_hit_ratio * other.retrieved_document_count as f64)
                / retrieved as f64
        };

        self.retrieved_document_count = retrieved;
        self.retrieved_document_size += other.retrieved_document_size;
        self.output_document_count += other.output_document_count;
        self.output_document_size += other.output_document_size;
        self.total_execution_time_ms += other.total_execution_time_ms;
        self.query_compile_time_ms += other.query_compile_time_ms;
        self.logical_plan_build_time_ms += other.logical_plan_build_time_ms;
        self.physical_plan_build_time_ms += other.physical_plan_build_time_ms;
        self.query_optimization_time_ms += other.query_optimization_time_ms;
        self.index_lookup_time_ms += other.index_lookup_time_ms;
        self.document_load_time_ms += other.document_load_time_ms;
        self.vm_execution_time_ms += other.vm_execution_time_ms;
        self.system_function_execution_time_ms += other.system_function_execution_time_ms;
        self.user_function_execution_time_ms += other.user_function_execution_time_ms;
        self.document_write_time_ms += other.document_write_time_ms;
    }
}

/// Backend metrics grouped by partition key range id
pub type PartitionedQueryMetrics = BTreeMap<String, QueryMetrics>;

/// Timing of one backend fetch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchExecutionRange {
    pub activity_id: String,
    pub partition_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub document_count: usize,
    pub retry_count: u32,
}

/// Metrics observed by the client rather than reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideMetrics {
    pub retries: u64,
    pub request_charge: f64,
    pub fetch_execution_ranges: Vec<FetchExecutionRange>,
    /// Most documents buffered client-side at once since the query started
    pub buffered_items_high_water: usize,
}

impl ClientSideMetrics {
    pub fn record_fetch(&mut self, range: FetchExecutionRange, request_charge: f64) {
        self.retries += u64::from(range.retry_count);
        self.request_charge += request_charge;
        self.fetch_execution_ranges.push(range);
    }
}
