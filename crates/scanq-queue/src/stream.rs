//! Stream handle: one named log, its group, and the codec for its payloads

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::codec::{Codec, FlatCodec, MALFORMED_FIELD, PRIORITY_FIELD, split_envelope};
use crate::config::QueueDefinition;
use crate::error::{QueueError, QueueResult};
use crate::log::{Entry, EntryId, GroupStart, MemoryLog, StreamLog};
use crate::metrics::QueueMetricsCollector;

/// Task priority carried in the envelope.
///
/// Priority is informational: it does not reorder entries in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    High = 1,
    #[default]
    Low = 2,
}

impl Priority {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "high" => Ok(Priority::High),
            "2" | "low" => Ok(Priority::Low),
            other => Err(QueueError::InvalidConfig(format!(
                "unknown priority '{}', expected 1/high or 2/low",
                other
            ))),
        }
    }
}

/// A decoded entry as handed to handlers
#[derive(Debug, Clone, PartialEq)]
pub struct TaskMessage<T> {
    pub id: EntryId,
    pub stream: String,
    pub group: String,
    /// Times the entry has been delivered, including this delivery
    pub retry_count: u64,
    /// Time since the previous delivery
    pub idle: Duration,
    pub priority: Priority,
    pub payload: T,
}

/// Typed handle to one stream and its consumer group
pub struct StreamQueue<T, C = FlatCodec, L = MemoryLog> {
    log: Arc<L>,
    definition: QueueDefinition,
    codec: Arc<C>,
    metrics: QueueMetricsCollector,
    _payload: PhantomData<fn() -> T>,
}

impl<T, C, L> Clone for StreamQueue<T, C, L> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            definition: self.definition.clone(),
            codec: Arc::clone(&self.codec),
            metrics: self.metrics.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T, C, L> fmt::Debug for StreamQueue<T, C, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamQueue")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl<T, C, L> StreamQueue<T, C, L>
where
    T: Send + Sync + 'static,
    C: Codec<T>,
    L: StreamLog,
{
    pub fn new(log: Arc<L>, definition: QueueDefinition, codec: C) -> Self {
        Self {
            log,
            definition,
            codec: Arc::new(codec),
            metrics: QueueMetricsCollector::default(),
            _payload: PhantomData,
        }
    }

    /// Share a metrics collector with other handles
    pub fn with_metrics(mut self, metrics: QueueMetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Same log and codec, different stream/group
    pub fn with_definition(&self, definition: QueueDefinition) -> Self {
        Self {
            definition,
            ..self.clone()
        }
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub fn stream(&self) -> &str {
        &self.definition.stream
    }

    pub fn group(&self) -> &str {
        &self.definition.group
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn metrics(&self) -> &QueueMetricsCollector {
        &self.metrics
    }

    /// Create the stream and the group if absent. Idempotent.
    pub async fn declare(&self, start: GroupStart) -> QueueResult<bool> {
        let created = self
            .log
            .create_group(self.stream(), self.group(), start)
            .await?;
        if created {
            info!(stream = %self.stream(), group = %self.group(), "Declared queue");
        } else {
            debug!(stream = %self.stream(), group = %self.group(), "Queue already declared");
        }
        Ok(created)
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.log.ping().await
    }

    /// Release the backend. Other clones of this handle share it.
    pub async fn close(&self) {
        self.log.close().await;
    }

    /// Decode a delivered entry together with its delivery bookkeeping
    pub(crate) fn to_task(
        &self,
        group: &str,
        entry: &Entry,
        retry_count: u64,
        idle: Duration,
    ) -> QueueResult<TaskMessage<T>> {
        let (envelope, payload_fields) = split_envelope(&entry.fields);
        if let Some(reason) = envelope.get(MALFORMED_FIELD) {
            return Err(QueueError::decode(entry.id, reason));
        }
        let payload = self
            .codec
            .decode(&payload_fields)
            .map_err(|reason| QueueError::decode(entry.id, reason))?;
        let priority = envelope
            .get(PRIORITY_FIELD)
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();

        Ok(TaskMessage {
            id: entry.id,
            stream: self.definition.stream.clone(),
            group: group.to_string(),
            retry_count,
            idle,
            priority,
            payload,
        })
    }
}

impl<T> StreamQueue<T, FlatCodec, MemoryLog>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    /// Queue over a fresh in-process log
    pub fn in_memory(definition: QueueDefinition) -> Self {
        Self::new(Arc::new(MemoryLog::new()), definition, FlatCodec)
    }
}

#[cfg(feature = "redis")]
impl<T, C> StreamQueue<T, C, crate::log::RedisLog>
where
    T: Send + Sync + 'static,
    C: Codec<T> + Default,
{
    /// Connect with bounded retry and wrap the pool in a queue handle.
    ///
    /// Exhausting the connection attempts is the one fatal error of the
    /// queue; see [`QueueError::is_fatal`].
    pub async fn connect_redis(
        config: crate::config::RedisConfig,
        definition: QueueDefinition,
    ) -> QueueResult<Self> {
        let log = crate::log::RedisLog::connect(config).await?;
        Ok(Self::new(Arc::new(log), definition, C::default()))
    }
}
