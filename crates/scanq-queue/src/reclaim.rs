//! Stale entry management: reclaim, eviction and queue state
//!
//! Entries delivered to a consumer that died or stalled stay in the group's
//! pending list. [`StreamQueue::reclaim_stale`] hands them to another
//! consumer while their delivery count is below `max_retry`;
//! [`StreamQueue::remove_stale`] deletes the ones that reached it, copying
//! them to the dead-letter stream first when one is configured.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Codec, DELIVERIES_FIELD, REASON_FIELD, SOURCE_ID_FIELD};
use crate::consumer::TaskHandler;
use crate::error::{QueueError, QueueResult};
use crate::log::{EntryId, PendingEntry, PendingQuery, StreamLog};
use crate::stream::StreamQueue;

/// Consumer name under which entries are held while being evicted
pub const REAPER_CONSUMER: &str = "scanq-reaper";

/// Counts describing a queue's health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueState {
    /// Entries in the stream
    pub total: usize,
    /// Entries never delivered to the group
    pub queued: usize,
    /// Entries delivered but not acknowledged
    pub stale: usize,
}

impl<T, C, L> StreamQueue<T, C, L>
where
    T: Send + Sync + 'static,
    C: Codec<T>,
    L: StreamLog,
{
    /// Pending entries idle at least `min_idle` that satisfy `keep`, in id
    /// order, at most `limit` of them.
    async fn scan_pending<F>(
        &self,
        group: &str,
        min_idle: Duration,
        limit: usize,
        keep: F,
    ) -> QueueResult<Vec<PendingEntry>>
    where
        F: Fn(&PendingEntry) -> bool,
    {
        let mut found = Vec::new();
        let mut start = EntryId::ZERO;
        while found.len() < limit {
            let page = self
                .log()
                .pending(
                    self.stream(),
                    group,
                    &PendingQuery {
                        start: Some(start),
                        ..PendingQuery::new(limit).with_min_idle(min_idle)
                    },
                )
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            start = last.id.successor();
            let exhausted = page.len() < limit;
            found.extend(page.into_iter().filter(|p| keep(p)));
            if exhausted {
                break;
            }
        }
        found.truncate(limit);
        Ok(found)
    }

    /// Reassign up to `max_batch` entries idle at least `min_idle` to
    /// `target` and run `handler` on each.
    ///
    /// Entries whose delivery count already reached the queue's `max_retry`
    /// are left for [`remove_stale`](Self::remove_stale), so the handler
    /// always sees `retry_count <= max_retry`. Successfully handled entries
    /// are acknowledged. Returns the number of entries claimed.
    pub async fn reclaim_stale<H>(
        &self,
        group: &str,
        target: &str,
        max_batch: usize,
        min_idle: Duration,
        handler: &H,
    ) -> QueueResult<usize>
    where
        H: TaskHandler<T> + ?Sized,
    {
        let max_retry = self.definition().max_retry;
        let candidates = self
            .scan_pending(group, min_idle, max_batch, |p| p.deliveries < max_retry)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let ids: Vec<EntryId> = candidates.iter().map(|p| p.id).collect();
        let claimed = self
            .log()
            .claim(self.stream(), group, target, min_idle, &ids)
            .await?;
        self.metrics().record_reclaimed(claimed.len());
        info!(
            stream = %self.stream(),
            group,
            target,
            claimed = claimed.len(),
            "Reclaimed stale entries"
        );

        for entry in &claimed {
            let Some(previous) = candidates.iter().find(|p| p.id == entry.id) else {
                continue;
            };
            self.handle_entry(
                group,
                target,
                entry,
                previous.deliveries + 1,
                previous.idle,
                handler,
            )
            .await?;
        }
        Ok(claimed.len())
    }

    /// Delete up to `max_batch` pending entries idle at least `min_ttl`
    /// whose delivery count reached `max_retry`.
    ///
    /// Each entry is first claimed by [`REAPER_CONSUMER`], so one that a
    /// worker picked up in the meantime is skipped. Returns the number of
    /// entries removed from both the pending list and the stream.
    pub async fn remove_stale(
        &self,
        group: &str,
        max_batch: usize,
        min_ttl: Duration,
    ) -> QueueResult<usize> {
        let max_retry = self.definition().max_retry;
        let poisoned = self
            .scan_pending(group, min_ttl, max_batch, |p| p.deliveries >= max_retry)
            .await?;
        if poisoned.is_empty() {
            return Ok(0);
        }

        let ids: Vec<EntryId> = poisoned.iter().map(|p| p.id).collect();
        let claimed = self
            .log()
            .claim(self.stream(), group, REAPER_CONSUMER, min_ttl, &ids)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let claimed_ids: Vec<EntryId> = claimed.iter().map(|e| e.id).collect();
        if let Some(dead_letter) = &self.definition().dead_letter {
            for (copied, entry) in claimed.iter().enumerate() {
                let deliveries = poisoned
                    .iter()
                    .find(|p| p.id == entry.id)
                    .map_or(max_retry, |p| p.deliveries);
                let mut fields = entry.fields.clone();
                fields.insert(SOURCE_ID_FIELD.to_string(), entry.id.to_string());
                fields.insert(DELIVERIES_FIELD.to_string(), deliveries.to_string());
                fields.insert(REASON_FIELD.to_string(), "max retries exceeded".to_string());
                let appended = self
                    .log()
                    .append(dead_letter, &fields, self.definition().trim_len())
                    .await;
                if let Err(e) = appended {
                    // Entries already copied must not be copied again next pass
                    self.settle(group, &claimed_ids[..copied]).await?;
                    return Err(e);
                }
                self.metrics().record_dead_lettered();
            }
        }
        self.settle(group, &claimed_ids).await?;

        warn!(
            stream = %self.stream(),
            group,
            evicted = claimed_ids.len(),
            max_retry,
            dead_letter = self.definition().dead_letter.as_deref().unwrap_or("-"),
            "Evicted entries that exhausted their retries"
        );
        Ok(claimed_ids.len())
    }

    /// Delete evicted entries, then drop their pending records.
    ///
    /// A failed ack leaves a pending reference to a deleted entry, which the
    /// next claim or delivery drops.
    async fn settle(&self, group: &str, ids: &[EntryId]) -> QueueResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.log().delete(self.stream(), ids).await?;
        self.log().ack(self.stream(), group, ids).await?;
        self.metrics().record_evicted(ids.len());
        Ok(())
    }

    /// Stream length, never-delivered count and pending count of `group`
    pub async fn get_state(&self, group: &str) -> QueueResult<QueueState> {
        let total = self.log().len(self.stream()).await?;
        let info = self
            .log()
            .group_info(self.stream(), group)
            .await?
            .ok_or_else(|| {
                QueueError::BackendError(format!(
                    "NOGROUP No such key '{}' or consumer group '{}'",
                    self.stream(),
                    group
                ))
            })?;

        Ok(QueueState {
            total,
            queued: info.lag.unwrap_or(0),
            stale: info.pending,
        })
    }
}

/// Settings for a periodic [`Reaper`]
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub max_batch: usize,
    /// Idle time after which an entry is reclaimed
    pub min_idle: Duration,
    /// Idle time after which an exhausted entry is evicted
    pub min_ttl: Duration,
}

impl ReaperConfig {
    /// Reclaim after `min_idle`, evict after the queue's `max_ttl`
    pub fn for_queue<T, C, L>(queue: &StreamQueue<T, C, L>, min_idle: Duration) -> Self
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
        L: StreamLog,
    {
        Self {
            interval: Duration::from_secs(30),
            max_batch: 100,
            min_idle,
            min_ttl: queue.definition().max_ttl,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }
}

/// Background task running eviction then reclaim on a fixed interval
pub struct Reaper;

impl Reaper {
    pub fn spawn<T, C, L, H>(
        queue: StreamQueue<T, C, L>,
        group: impl Into<String>,
        target: impl Into<String>,
        config: ReaperConfig,
        handler: Arc<H>,
        token: CancellationToken,
    ) -> JoinHandle<()>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
        L: StreamLog,
        H: TaskHandler<T> + 'static,
    {
        let group = group.into();
        let target = target.into();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(stream = %queue.stream(), group = %group, every = ?config.interval, "Reaper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match queue
                    .remove_stale(&group, config.max_batch, config.min_ttl)
                    .await
                {
                    Ok(0) => {}
                    Ok(evicted) => debug!(group = %group, evicted, "Reaper evicted entries"),
                    Err(e) => warn!(group = %group, error = %e, "Reaper eviction failed"),
                }
                if let Err(e) = queue
                    .reclaim_stale(
                        &group,
                        &target,
                        config.max_batch,
                        config.min_idle,
                        handler.as_ref(),
                    )
                    .await
                {
                    warn!(group = %group, error = %e, "Reaper reclaim failed");
                }
            }

            info!(stream = %queue.stream(), group = %group, "Reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueDefinition;
    use crate::error::HandlerError;
    use crate::codec::{Fields, FlatCodec};
    use crate::log::{Entry, GroupInfo, GroupStart, MemoryLog, ReadCursor};
    use crate::stream::{Priority, TaskMessage};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        n: u32,
    }

    fn fail(_task: TaskMessage<Job>) -> futures::future::Ready<Result<(), HandlerError>> {
        futures::future::ready(Err("still broken".into()))
    }

    /// `count` entries, all delivered to `dead-worker` and never acked
    async fn abandoned(count: u32, definition: QueueDefinition) -> StreamQueue<Job> {
        let queue = StreamQueue::in_memory(definition);
        queue.declare(GroupStart::Beginning).await.unwrap();
        for n in 0..count {
            queue.publish(Priority::Low, &Job { n }).await.unwrap();
        }
        let _ = queue
            .subscribe("g", "dead-worker", Duration::from_millis(5), &fail)
            .await;
        queue
    }

    #[tokio::test]
    async fn test_reclaim_respects_batch_and_acks() {
        let queue = abandoned(8, QueueDefinition::new("jobs", "g")).await;
        let ok = |_task: TaskMessage<Job>| async { Ok::<(), HandlerError>(()) };

        let claimed = queue
            .reclaim_stale("g", "worker-a", 5, Duration::ZERO, &ok)
            .await
            .unwrap();
        assert_eq!(claimed, 5);

        let state = queue.get_state("g").await.unwrap();
        assert_eq!(state, QueueState { total: 8, queued: 0, stale: 3 });
    }

    #[tokio::test]
    async fn test_reclaim_honors_min_idle() {
        let queue = abandoned(2, QueueDefinition::new("jobs", "g")).await;
        let claimed = queue
            .reclaim_stale("g", "worker-a", 10, Duration::from_secs(60), &fail)
            .await
            .unwrap();
        assert_eq!(claimed, 0);
    }

    #[tokio::test]
    async fn test_reclaim_stops_at_max_retry_then_evicts() {
        let definition = QueueDefinition::new("jobs", "g")
            .with_max_retry(3)
            .with_dead_letter("jobs-dead");
        let queue = abandoned(1, definition).await;

        let seen = std::sync::Mutex::new(Vec::new());
        let record = |task: TaskMessage<Job>| {
            seen.lock().unwrap().push(task.retry_count);
            async { Err::<(), HandlerError>("nope".into()) }
        };
        for _ in 0..4 {
            queue
                .reclaim_stale("g", "worker-a", 10, Duration::ZERO, &record)
                .await
                .unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);

        let removed = queue.remove_stale("g", 10, Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.remove_stale("g", 10, Duration::ZERO).await.unwrap(), 0);

        let state = queue.get_state("g").await.unwrap();
        assert_eq!(state.total, 0);
        assert_eq!(state.stale, 0);

        let dead = queue
            .log()
            .read("jobs-dead", EntryId::ZERO, 10, None)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].fields["n"], "0");
        assert_eq!(dead[0].fields[DELIVERIES_FIELD], "3");
        assert_eq!(queue.metrics().snapshot().dead_lettered_total, 1);
    }

    #[tokio::test]
    async fn test_get_state_unknown_group() {
        let queue: StreamQueue<Job> = StreamQueue::in_memory(QueueDefinition::new("jobs", "g"));
        queue.declare(GroupStart::Beginning).await.unwrap();
        assert!(queue.get_state("other").await.is_err());
    }

    #[tokio::test]
    async fn test_reaper_evicts_in_background() {
        let queue = abandoned(2, QueueDefinition::new("jobs", "g").with_max_retry(1)).await;
        let token = CancellationToken::new();
        let config = ReaperConfig {
            interval: Duration::from_millis(10),
            max_batch: 10,
            min_idle: Duration::ZERO,
            min_ttl: Duration::ZERO,
        };

        let handle = Reaper::spawn(
            queue.clone(),
            "g",
            "worker-a",
            config,
            Arc::new(fail),
            token.clone(),
        );
        for _ in 0..100 {
            if queue.log().len("jobs").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        handle.await.unwrap();

        assert_eq!(queue.log().len("jobs").await.unwrap(), 0);
        assert_eq!(queue.metrics().snapshot().evicted_total, 2);
    }

    /// Memory log whose deletes and dead-letter appends can be made to fail
    struct FlakyLog {
        inner: MemoryLog,
        fail_delete: AtomicBool,
        dead_letter_budget: AtomicUsize,
    }

    impl FlakyLog {
        fn new() -> Self {
            Self {
                inner: MemoryLog::new(),
                fail_delete: AtomicBool::new(false),
                dead_letter_budget: AtomicUsize::new(usize::MAX),
            }
        }
    }

    fn link_down() -> QueueError {
        QueueError::ConnectionFailed("link down".to_string())
    }

    #[async_trait]
    impl StreamLog for FlakyLog {
        async fn ping(&self) -> QueueResult<()> {
            self.inner.ping().await
        }

        async fn create_group(
            &self,
            stream: &str,
            group: &str,
            start: GroupStart,
        ) -> QueueResult<bool> {
            self.inner.create_group(stream, group, start).await
        }

        async fn append(
            &self,
            stream: &str,
            fields: &Fields,
            max_len: Option<usize>,
        ) -> QueueResult<EntryId> {
            if stream == "jobs-dead"
                && self
                    .dead_letter_budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_err()
            {
                return Err(link_down());
            }
            self.inner.append(stream, fields, max_len).await
        }

        async fn read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            cursor: ReadCursor,
            count: usize,
            block: Option<Duration>,
        ) -> QueueResult<Vec<Entry>> {
            self.inner
                .read_group(stream, group, consumer, cursor, count, block)
                .await
        }

        async fn read(
            &self,
            stream: &str,
            after: EntryId,
            count: usize,
            block: Option<Duration>,
        ) -> QueueResult<Vec<Entry>> {
            self.inner.read(stream, after, count, block).await
        }

        async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> QueueResult<usize> {
            self.inner.ack(stream, group, ids).await
        }

        async fn pending(
            &self,
            stream: &str,
            group: &str,
            query: &PendingQuery,
        ) -> QueueResult<Vec<PendingEntry>> {
            self.inner.pending(stream, group, query).await
        }

        async fn claim(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            ids: &[EntryId],
        ) -> QueueResult<Vec<Entry>> {
            self.inner.claim(stream, group, consumer, min_idle, ids).await
        }

        async fn delete(&self, stream: &str, ids: &[EntryId]) -> QueueResult<usize> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(link_down());
            }
            self.inner.delete(stream, ids).await
        }

        async fn len(&self, stream: &str) -> QueueResult<usize> {
            self.inner.len(stream).await
        }

        async fn group_info(&self, stream: &str, group: &str) -> QueueResult<Option<GroupInfo>> {
            self.inner.group_info(stream, group).await
        }
    }

    async fn abandoned_on_flaky(
        count: u32,
        definition: QueueDefinition,
    ) -> (Arc<FlakyLog>, StreamQueue<Job, FlatCodec, FlakyLog>) {
        let log = Arc::new(FlakyLog::new());
        let queue = StreamQueue::new(Arc::clone(&log), definition, FlatCodec);
        queue.declare(GroupStart::Beginning).await.unwrap();
        for n in 0..count {
            queue.publish(Priority::Low, &Job { n }).await.unwrap();
        }
        let _ = queue
            .subscribe("g", "dead-worker", Duration::from_millis(5), &fail)
            .await;
        (log, queue)
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_entry_evictable() {
        let (log, queue) =
            abandoned_on_flaky(1, QueueDefinition::new("jobs", "g").with_max_retry(1)).await;

        log.fail_delete.store(true, Ordering::SeqCst);
        let err = queue.remove_stale("g", 10, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, QueueError::ConnectionFailed(_)));

        let state = queue.get_state("g").await.unwrap();
        assert_eq!(state, QueueState { total: 1, queued: 0, stale: 1 });

        log.fail_delete.store(false, Ordering::SeqCst);
        assert_eq!(queue.remove_stale("g", 10, Duration::ZERO).await.unwrap(), 1);
        let state = queue.get_state("g").await.unwrap();
        assert_eq!(state, QueueState { total: 0, queued: 0, stale: 0 });
    }

    #[tokio::test]
    async fn test_dead_letter_failure_does_not_duplicate_copies() {
        let definition = QueueDefinition::new("jobs", "g")
            .with_max_retry(1)
            .with_dead_letter("jobs-dead");
        let (log, queue) = abandoned_on_flaky(3, definition).await;

        log.dead_letter_budget.store(1, Ordering::SeqCst);
        assert!(queue.remove_stale("g", 10, Duration::ZERO).await.is_err());
        assert_eq!(queue.log().len("jobs").await.unwrap(), 2);

        log.dead_letter_budget.store(usize::MAX, Ordering::SeqCst);
        assert_eq!(queue.remove_stale("g", 10, Duration::ZERO).await.unwrap(), 2);

        let dead = queue
            .log()
            .read("jobs-dead", EntryId::ZERO, 10, None)
            .await
            .unwrap();
        let copied: Vec<&str> = dead.iter().map(|e| e.fields["n"].as_str()).collect();
        assert_eq!(copied, vec!["0", "1", "2"]);
        assert_eq!(queue.metrics().snapshot().evicted_total, 3);
    }
}
