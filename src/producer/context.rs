//! Collaborators and shared counters for every fetcher of one query

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::observability::RequestChargeTracker;
use crate::routing::RoutingMapProvider;
use crate::transport::{QueryTransport, RetryPolicy};

use super::budget::BufferBudget;
use super::page::FetchCompletion;

/// Adaptive page size bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizing {
    pub initial: usize,
    pub max: usize,
}

impl PageSizing {
    /// Growth factor applied after each successful fetch
    pub const GROWTH: f64 = 1.6;

    pub fn new(initial: usize, max: usize) -> Self {
        let max = max.max(1);
        Self {
            initial: initial.clamp(1, max),
            max,
        }
    }

    /// `min(floor(initial * 1.6^fetches), max)`
    pub fn page_size(&self, successful_fetches: u32) -> usize {
        let grown = self.initial as f64 * Self::GROWTH.powi(successful_fetches.min(64) as i32);
        if grown >= self.max as f64 {
            self.max
        } else {
            (grown.floor() as usize).max(1)
        }
    }
}

pub struct FetchContext {
    pub transport: Arc<dyn QueryTransport>,
    pub routing: Arc<dyn RoutingMapProvider>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub budget: Arc<BufferBudget>,
    pub charge: Arc<RequestChargeTracker>,
    pub completions: mpsc::UnboundedSender<FetchCompletion>,
    pub page_sizing: PageSizing,
    /// Pages one partition may queue ahead of its consumer
    pub page_queue_depth: usize,
}
