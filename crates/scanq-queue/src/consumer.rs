//! Consumer-group workers
//!
//! A subscriber first drains its own backlog (entries delivered to this
//! consumer name earlier and never acknowledged), then reads new entries
//! with a bounded block. The log decides which consumer owns an entry;
//! nothing here coordinates workers beyond naming them.

use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::error::{HandlerError, QueueError, QueueResult};
use crate::log::{Entry, EntryId, PendingQuery, ReadCursor, StreamLog};
use crate::stream::{StreamQueue, TaskMessage};

/// Entries requested per new-entry read. One at a time keeps the share of
/// each worker proportional to its speed.
const READ_BATCH: usize = 1;

/// Entries requested per backlog read
const BACKLOG_BATCH: usize = 32;

/// Processes one delivered task. Returning an error leaves the entry pending.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync {
    async fn handle(&self, task: TaskMessage<T>) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T, F, Fut> TaskHandler<T> for F
where
    T: Send + 'static,
    F: Fn(TaskMessage<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, task: TaskMessage<T>) -> Result<(), HandlerError> {
        (self)(task).await
    }
}

/// What happened to one delivered entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked,
    HandlerFailed,
    DecodeFailed,
    /// Entry had been deleted from the stream; its pending record was dropped
    Tombstone,
}

impl<T, C, L> StreamQueue<T, C, L>
where
    T: Send + Sync + 'static,
    C: Codec<T>,
    L: StreamLog,
{
    /// Join `group` as `consumer` and process entries until a block window
    /// passes with no new entry.
    ///
    /// The consumer's own pending backlog is processed first, once. The
    /// call always ends with an error: [`QueueError::Timeout`] after an
    /// empty window, anything else on a backend failure.
    pub async fn subscribe<H>(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
        handler: &H,
    ) -> QueueResult<()>
    where
        H: TaskHandler<T> + ?Sized,
    {
        self.drain_backlog(group, consumer, handler).await?;

        loop {
            let batch = self
                .log()
                .read_group(
                    self.stream(),
                    group,
                    consumer,
                    ReadCursor::New,
                    READ_BATCH,
                    Some(block),
                )
                .await?;
            if batch.is_empty() {
                debug!(stream = %self.stream(), group, consumer, "No new entries within block window");
                return Err(QueueError::Timeout(block));
            }
            self.deliver_batch(group, consumer, &batch, handler).await?;
        }
    }

    /// Like [`subscribe`](Self::subscribe), but keeps polling across empty
    /// windows until `token` is cancelled.
    ///
    /// Backend errors are logged and retried after one block interval. An
    /// entry being handled when the token fires is finished first.
    pub async fn subscribe_until<H>(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
        handler: &H,
        token: &CancellationToken,
    ) -> QueueResult<()>
    where
        H: TaskHandler<T> + ?Sized,
    {
        info!(stream = %self.stream(), group, consumer, "Consumer started");

        let mut backlog_drained = false;
        while !token.is_cancelled() {
            let result = if backlog_drained {
                // Only the wait for new entries is cancellable; a delivered
                // entry is always handled to completion.
                let read = tokio::select! {
                    _ = token.cancelled() => break,
                    read = self.log().read_group(
                        self.stream(),
                        group,
                        consumer,
                        ReadCursor::New,
                        READ_BATCH,
                        Some(block),
                    ) => read,
                };
                match read {
                    Ok(batch) => self.deliver_batch(group, consumer, &batch, handler).await,
                    Err(e) => Err(e),
                }
            } else {
                self.drain_backlog(group, consumer, handler)
                    .await
                    .map(|_| backlog_drained = true)
            };

            if let Err(e) = result {
                warn!(
                    stream = %self.stream(),
                    group,
                    consumer,
                    error = %e,
                    "Consumer read failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(block) => {}
                }
            }
        }

        info!(stream = %self.stream(), group, consumer, "Consumer stopped");
        Ok(())
    }

    async fn deliver_batch<H>(
        &self,
        group: &str,
        consumer: &str,
        batch: &[Entry],
        handler: &H,
    ) -> QueueResult<()>
    where
        H: TaskHandler<T> + ?Sized,
    {
        for entry in batch {
            self.deliver(group, consumer, entry, handler).await?;
        }
        Ok(())
    }

    /// One bounded pass over this consumer's own pending entries
    async fn drain_backlog<H>(&self, group: &str, consumer: &str, handler: &H) -> QueueResult<usize>
    where
        H: TaskHandler<T> + ?Sized,
    {
        let mut cursor = EntryId::ZERO;
        let mut seen = 0;
        loop {
            let batch = self
                .log()
                .read_group(
                    self.stream(),
                    group,
                    consumer,
                    ReadCursor::Backlog(cursor),
                    BACKLOG_BATCH,
                    None,
                )
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.id;
            seen += batch.len();
            self.deliver_batch(group, consumer, &batch, handler).await?;
        }

        if seen > 0 {
            info!(stream = %self.stream(), group, consumer, entries = seen, "Processed own backlog");
        }
        Ok(seen)
    }

    /// Decode, handle and acknowledge one entry.
    ///
    /// Decode and handler failures are logged and counted, not returned; only
    /// backend errors propagate.
    pub(crate) async fn deliver<H>(
        &self,
        group: &str,
        consumer: &str,
        entry: &Entry,
        handler: &H,
    ) -> QueueResult<Outcome>
    where
        H: TaskHandler<T> + ?Sized,
    {
        if entry.is_tombstone() {
            self.log().ack(self.stream(), group, &[entry.id]).await?;
            debug!(stream = %self.stream(), id = %entry.id, "Dropped pending reference to deleted entry");
            return Ok(Outcome::Tombstone);
        }

        let (retry_count, idle) = self
            .log()
            .pending(self.stream(), group, &PendingQuery::single(entry.id))
            .await?
            .first()
            .map(|p| (p.deliveries, p.idle))
            .unwrap_or((1, Duration::ZERO));

        self.handle_entry(group, consumer, entry, retry_count, idle, handler)
            .await
    }

    /// Shared by delivery and reclaim once the bookkeeping is known
    pub(crate) async fn handle_entry<H>(
        &self,
        group: &str,
        consumer: &str,
        entry: &Entry,
        retry_count: u64,
        idle: Duration,
        handler: &H,
    ) -> QueueResult<Outcome>
    where
        H: TaskHandler<T> + ?Sized,
    {
        let task = match self.to_task(group, entry, retry_count, idle) {
            Ok(task) => task,
            Err(e) => {
                self.metrics().record_decode_failure();
                warn!(
                    stream = %self.stream(),
                    group,
                    consumer,
                    id = %entry.id,
                    error = %e,
                    "Failed to decode entry, leaving it pending"
                );
                return Ok(Outcome::DecodeFailed);
            }
        };

        self.metrics().record_delivery();
        let started = Instant::now();
        match handler.handle(task).await {
            Ok(()) => {
                self.log().ack(self.stream(), group, &[entry.id]).await?;
                self.metrics().record_ack(consumer, started.elapsed());
                debug!(stream = %self.stream(), consumer, id = %entry.id, retry_count, "Acknowledged entry");
                Ok(Outcome::Acked)
            }
            Err(e) => {
                self.metrics().record_handler_failure();
                let err = QueueError::HandlerFailed {
                    id: entry.id.to_string(),
                    reason: e.to_string(),
                };
                warn!(
                    stream = %self.stream(),
                    group,
                    consumer,
                    retry_count,
                    error = %err,
                    "Handler failed, leaving entry pending"
                );
                Ok(Outcome::HandlerFailed)
            }
        }
    }
}

/// N subscribers on one group sharing a cancellation token.
///
/// Consumers are named `<prefix>-1` .. `<prefix>-N`.
pub struct WorkerPool {
    token: CancellationToken,
    workers: Vec<(String, JoinHandle<QueueResult<()>>)>,
}

impl WorkerPool {
    /// Spawn `size` workers running [`StreamQueue::subscribe_until`]
    pub fn spawn<T, C, L, H>(
        queue: &StreamQueue<T, C, L>,
        group: &str,
        prefix: &str,
        size: usize,
        block: Duration,
        handler: Arc<H>,
    ) -> Self
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
        L: StreamLog,
        H: TaskHandler<T> + 'static,
    {
        let token = CancellationToken::new();
        let workers = (1..=size)
            .map(|n| {
                let consumer = format!("{}-{}", prefix, n);
                let queue = queue.clone();
                let group = group.to_string();
                let name = consumer.clone();
                let handler = Arc::clone(&handler);
                let token = token.clone();
                let handle = tokio::spawn(async move {
                    queue
                        .subscribe_until(&group, &name, block, handler.as_ref(), &token)
                        .await
                });
                (consumer, handle)
            })
            .collect();

        info!(stream = %queue.stream(), group, size, "Started worker pool");
        Self { token, workers }
    }

    pub fn consumers(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Token observed by every worker; cancel it to stop the pool
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel all workers and wait for them to finish their current entry
    pub async fn shutdown(self) -> Vec<(String, QueueResult<()>)> {
        self.token.cancel();
        let (names, handles): (Vec<_>, Vec<_>) = self.workers.into_iter().unzip();
        let results: Vec<_> = names
            .into_iter()
            .zip(join_all(handles).await)
            .map(|(name, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    Err(QueueError::BackendError(format!("worker panicked: {}", e)))
                });
                (name, result)
            })
            .collect();
        debug!(workers = results.len(), "Worker pool stopped");
        results
    }
}
