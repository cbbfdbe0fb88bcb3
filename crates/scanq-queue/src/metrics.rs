//! Metrics collection for queue operations
//!
//! Best-effort counters shared by producers, workers and the reclaim path of
//! one process. Per-consumer tallies are capped to keep cardinality bounded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Snapshot of queue counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueMetrics {
    /// Entries appended by this process
    pub published_total: u64,
    /// Candidates refused by a backpressure gate
    pub rejected_total: u64,
    /// Entries handed to a handler
    pub delivered_total: u64,
    /// Entries acknowledged after a successful handler run
    pub acked_total: u64,
    /// Handler runs that returned an error
    pub handler_failures_total: u64,
    /// Entries whose fields did not decode into the payload type
    pub decode_failures_total: u64,
    /// Entries reassigned by reclaim
    pub reclaimed_total: u64,
    /// Entries removed after exhausting their retries
    pub evicted_total: u64,
    /// Evicted entries copied to a dead-letter stream
    pub dead_lettered_total: u64,
    /// Replies published by request/reply servers
    pub replies_total: u64,
    /// Acknowledged entries per consumer (limited cardinality)
    pub acked_by_consumer: HashMap<String, u64>,
    /// Handler latency statistics, computed when the snapshot is taken
    pub handler_latency_ms: LatencyStats,
}

/// Latency statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

#[derive(Debug, Default)]
struct Inner {
    metrics: QueueMetrics,
    latency_samples: VecDeque<u64>,
}

/// Metrics collector with cardinality limits
#[derive(Debug, Clone)]
pub struct QueueMetricsCollector {
    inner: Arc<Mutex<Inner>>,
    /// Maximum number of consumers to track individually
    max_consumers: usize,
    /// Maximum latency samples to keep
    max_samples: usize,
}

impl Default for QueueMetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl QueueMetricsCollector {
    /// Create a new metrics collector
    pub fn new(max_consumers: usize, max_samples: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_consumers,
            max_samples,
        }
    }

    /// Create with default limits
    pub fn with_defaults() -> Self {
        Self::new(64, 1000)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, counter: impl FnOnce(&mut QueueMetrics) -> &mut u64) {
        let mut inner = self.lock();
        let value = counter(&mut inner.metrics);
        *value = value.saturating_add(1);
    }

    pub fn record_publish(&self) {
        self.bump(|m| &mut m.published_total);
    }

    pub fn record_rejected(&self) {
        self.bump(|m| &mut m.rejected_total);
    }

    pub fn record_delivery(&self) {
        self.bump(|m| &mut m.delivered_total);
    }

    /// Record an acknowledgment and how long the handler took
    pub fn record_ack(&self, consumer: &str, handler_time: Duration) {
        let mut inner = self.lock();
        inner.metrics.acked_total = inner.metrics.acked_total.saturating_add(1);

        let tracked = inner.metrics.acked_by_consumer.len();
        if let Some(count) = inner.metrics.acked_by_consumer.get_mut(consumer) {
            *count = count.saturating_add(1);
        } else if tracked < self.max_consumers {
            inner
                .metrics
                .acked_by_consumer
                .insert(consumer.to_string(), 1);
        }

        inner.latency_samples.push_back(handler_time.as_millis() as u64);
        while inner.latency_samples.len() > self.max_samples {
            inner.latency_samples.pop_front();
        }
    }

    pub fn record_handler_failure(&self) {
        self.bump(|m| &mut m.handler_failures_total);
    }

    pub fn record_decode_failure(&self) {
        self.bump(|m| &mut m.decode_failures_total);
    }

    pub fn record_reclaimed(&self, count: usize) {
        let mut inner = self.lock();
        inner.metrics.reclaimed_total = inner.metrics.reclaimed_total.saturating_add(count as u64);
    }

    pub fn record_evicted(&self, count: usize) {
        let mut inner = self.lock();
        inner.metrics.evicted_total = inner.metrics.evicted_total.saturating_add(count as u64);
    }

    pub fn record_dead_lettered(&self) {
        self.bump(|m| &mut m.dead_lettered_total);
    }

    pub fn record_reply(&self) {
        self.bump(|m| &mut m.replies_total);
    }

    fn calculate_percentiles(mut sorted: Vec<u64>) -> LatencyStats {
        if sorted.is_empty() {
            return LatencyStats::default();
        }
        sorted.sort_unstable();

        let at = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)] as f64;
        LatencyStats {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
            max: sorted[sorted.len() - 1] as f64,
        }
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> QueueMetrics {
        let (mut metrics, samples) = {
            let inner = self.lock();
            (
                inner.metrics.clone(),
                inner.latency_samples.iter().copied().collect(),
            )
        };
        metrics.handler_latency_ms = Self::calculate_percentiles(samples);
        metrics
    }

    /// Reset all metrics
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = Inner::default();
    }
}
