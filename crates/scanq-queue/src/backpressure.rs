//! Backpressure gate for producers
//!
//! [`QueueLimit`] is consulted before an enqueue. It reads the current
//! stream length and rejects the candidate once the length meets or exceeds
//! the limit. The check and the append are separate operations, so
//! concurrent producers can overshoot the limit by the number of racing
//! appends.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::error::{QueueError, QueueResult};
use crate::log::StreamLog;
use crate::stream::StreamQueue;

/// Backpressure configuration
#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Stream length at which the signal turns to warning (soft limit)
    pub warning_threshold: usize,
    /// Stream length at which new items are rejected (hard limit)
    pub blocking_threshold: usize,
    /// How often `wait_for_capacity` re-reads the stream length
    pub poll_interval: Duration,
}

impl BackpressureConfig {
    /// Warning at 80% of `limit`, rejection at `limit`
    pub fn for_limit(limit: usize) -> Self {
        Self {
            warning_threshold: limit.saturating_mul(4) / 5,
            blocking_threshold: limit,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Backpressure signal indicating queue load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureSignal {
    /// Normal operation - no backpressure
    Normal,
    /// Warning level - approaching limits
    Warning,
    /// Critical level - new items are rejected
    Critical,
}

/// Backpressure statistics
#[derive(Debug, Clone, Default)]
pub struct BackpressureStats {
    /// Stream length at the last check
    pub current_depth: usize,
    /// Maximum stream length observed
    pub max_depth: usize,
    /// Number of checks at or above the warning threshold
    pub warning_count: u64,
    /// Number of checks at or above the hard limit
    pub critical_count: u64,
    /// Candidates admitted
    pub admitted: u64,
    /// Candidates rejected
    pub rejected: u64,
    /// Last check timestamp
    pub last_check: Option<Instant>,
}

/// Tracks observed stream depth against the configured thresholds
pub struct BackpressureMonitor {
    config: BackpressureConfig,
    stats: Arc<RwLock<BackpressureStats>>,
    current_signal: Arc<RwLock<BackpressureSignal>>,
}

impl BackpressureMonitor {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            stats: Arc::new(RwLock::new(BackpressureStats::default())),
            current_signal: Arc::new(RwLock::new(BackpressureSignal::Normal)),
        }
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Record an observed depth and compute the signal for it
    pub async fn update_depth(&self, depth: usize) -> BackpressureSignal {
        let mut stats = self.stats.write().await;
        let mut signal = self.current_signal.write().await;

        stats.current_depth = depth;
        stats.last_check = Some(Instant::now());
        stats.max_depth = stats.max_depth.max(depth);

        let new_signal = if depth >= self.config.blocking_threshold {
            stats.critical_count += 1;
            BackpressureSignal::Critical
        } else if depth >= self.config.warning_threshold {
            stats.warning_count += 1;
            if *signal == BackpressureSignal::Normal {
                debug!(
                    depth,
                    threshold = self.config.warning_threshold,
                    "Backpressure warning"
                );
            }
            BackpressureSignal::Warning
        } else {
            BackpressureSignal::Normal
        };

        *signal = new_signal;
        new_signal
    }

    pub async fn signal(&self) -> BackpressureSignal {
        *self.current_signal.read().await
    }

    pub async fn should_block(&self) -> bool {
        self.signal().await == BackpressureSignal::Critical
    }

    pub async fn stats(&self) -> BackpressureStats {
        self.stats.read().await.clone()
    }

    pub async fn reset_stats(&self) {
        let mut stats = self.stats.write().await;
        *stats = BackpressureStats::default();
        debug!("Reset backpressure statistics");
    }

    async fn record_decision(&self, admitted: bool) {
        let mut stats = self.stats.write().await;
        if admitted {
            stats.admitted += 1;
        } else {
            stats.rejected += 1;
        }
    }
}

type RejectCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Pre-enqueue predicate rejecting items once a stream is full
pub struct QueueLimit<T> {
    monitor: Arc<BackpressureMonitor>,
    on_reject: Option<RejectCallback<T>>,
}

impl<T> Clone for QueueLimit<T> {
    fn clone(&self) -> Self {
        Self {
            monitor: Arc::clone(&self.monitor),
            on_reject: self.on_reject.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueLimit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueLimit")
            .field("limit", &self.limit())
            .field("on_reject", &self.on_reject.is_some())
            .finish()
    }
}

impl<T> QueueLimit<T> {
    pub fn new(limit: usize) -> Self {
        Self::with_config(BackpressureConfig::for_limit(limit))
    }

    pub fn with_config(config: BackpressureConfig) -> Self {
        Self {
            monitor: Arc::new(BackpressureMonitor::new(config)),
            on_reject: None,
        }
    }

    /// Called with every rejected item
    pub fn on_reject<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_reject = Some(Arc::new(callback));
        self
    }

    pub fn limit(&self) -> usize {
        self.monitor.config().blocking_threshold
    }

    pub fn monitor(&self) -> &BackpressureMonitor {
        &self.monitor
    }

    /// Decide whether `item` may be enqueued onto `queue`.
    ///
    /// Returns `false` and invokes the rejection callback when the stream
    /// length is at or above the limit.
    pub async fn admit<C, L>(&self, queue: &StreamQueue<T, C, L>, item: &T) -> QueueResult<bool>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
        L: StreamLog,
    {
        let depth = queue.log().len(queue.stream()).await?;
        let signal = self.monitor.update_depth(depth).await;
        let admitted = signal != BackpressureSignal::Critical;
        self.monitor.record_decision(admitted).await;

        if !admitted {
            warn!(
                stream = %queue.stream(),
                depth,
                limit = self.limit(),
                "Queue limit reached, rejecting item"
            );
            queue.metrics().record_rejected();
            if let Some(callback) = &self.on_reject {
                callback(item);
            }
        }
        Ok(admitted)
    }

    /// Wait until the stream drops below the limit
    pub async fn wait_for_capacity<C, L>(
        &self,
        queue: &StreamQueue<T, C, L>,
        timeout: Duration,
    ) -> QueueResult<()>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
        L: StreamLog,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let depth = queue.log().len(queue.stream()).await?;
            if self.monitor.update_depth(depth).await != BackpressureSignal::Critical {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(QueueError::Timeout(timeout));
            }
            tokio::time::sleep(self.monitor.config().poll_interval).await;
        }
    }
}
