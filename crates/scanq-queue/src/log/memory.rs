//! In-process implementation of [`StreamLog`]
//!
//! Mirrors the consumer-group semantics of Redis streams closely enough that
//! the queue behaves identically on top of it: per-group cursors, a pending
//! entry list with delivery counters and idle clocks, and blocking reads
//! woken by appends.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{
    Entry, EntryId, GroupInfo, GroupStart, PendingEntry, PendingQuery, ReadCursor, StreamLog,
};
use crate::codec::Fields;
use crate::error::{QueueError, QueueResult};

#[derive(Debug)]
struct PendingRecord {
    consumer: String,
    deliveries: u64,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pel: BTreeMap<EntryId, PendingRecord>,
    consumers: HashSet<String>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        if now_ms > self.last_id.ms() {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.successor()
        }
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> QueueResult<&mut GroupState> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))
    }
}

fn no_group(stream: &str, group: &str) -> QueueError {
    QueueError::BackendError(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

/// In-memory append-only log with consumer groups
#[derive(Debug, Default)]
pub struct MemoryLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> QueueResult<Vec<Entry>> {
        let mut streams = self.lock();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        group_state.consumers.insert(consumer.to_string());
        let now = Instant::now();
        let count = count.max(1);

        match cursor {
            ReadCursor::New => {
                let batch: Vec<Entry> = entries
                    .range(group_state.last_delivered.successor()..)
                    .take(count)
                    .map(|(id, fields)| Entry {
                        id: *id,
                        fields: fields.clone(),
                    })
                    .collect();
                for entry in &batch {
                    group_state.last_delivered = entry.id;
                    group_state.pel.insert(
                        entry.id,
                        PendingRecord {
                            consumer: consumer.to_string(),
                            deliveries: 1,
                            delivered_at: now,
                        },
                    );
                }
                Ok(batch)
            }
            ReadCursor::Backlog(after) => {
                let mut batch = Vec::new();
                for (id, record) in group_state.pel.range_mut(after.successor()..) {
                    if batch.len() >= count {
                        break;
                    }
                    if record.consumer != consumer {
                        continue;
                    }
                    record.deliveries += 1;
                    record.delivered_at = now;
                    batch.push(Entry {
                        id: *id,
                        fields: entries.get(id).cloned().unwrap_or_default(),
                    });
                }
                Ok(batch)
            }
        }
    }

    fn try_read(&self, stream: &str, after: EntryId, count: usize) -> Vec<Entry> {
        let streams = self.lock();
        let Some(state) = streams.get(stream) else {
            return Vec::new();
        };
        state
            .entries
            .range(after.successor()..)
            .take(count.max(1))
            .map(|(id, fields)| Entry {
                id: *id,
                fields: fields.clone(),
            })
            .collect()
    }

    /// Waits for entries produced by `attempt`, re-running it after every
    /// append until it yields something or `block` elapses.
    async fn blocking<F>(&self, block: Option<Duration>, mut attempt: F) -> QueueResult<Vec<Entry>>
    where
        F: FnMut() -> QueueResult<Vec<Entry>>,
    {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = attempt()?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[async_trait]
impl StreamLog for MemoryLog {
    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> QueueResult<bool> {
        let mut streams = self.lock();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        let last_delivered = match start {
            GroupStart::Beginning => EntryId::ZERO,
            GroupStart::Latest => state.last_id,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                ..Default::default()
            },
        );
        debug!(stream = %stream, group = %group, "Created consumer group");
        Ok(true)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &Fields,
        max_len: Option<usize>,
    ) -> QueueResult<EntryId> {
        if fields.is_empty() {
            return Err(QueueError::EncodeFailed(
                "cannot append a record with no fields".to_string(),
            ));
        }
        let id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id();
            state.last_id = id;
            state.entries.insert(id, fields.clone());
            if let Some(max_len) = max_len {
                while state.entries.len() > max_len {
                    state.entries.pop_first();
                }
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
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
        let block = match cursor {
            ReadCursor::New => block,
            ReadCursor::Backlog(_) => None,
        };
        self.blocking(block, || {
            self.try_read_group(stream, group, consumer, cursor, count)
        })
        .await
    }

    async fn read(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<Entry>> {
        self.blocking(block, || Ok(self.try_read(stream, after, count)))
            .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> QueueResult<usize> {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let group_state = state.group_mut(stream, group)?;
        Ok(ids
            .iter()
            .filter(|id| group_state.pel.remove(id).is_some())
            .count())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        query: &PendingQuery,
    ) -> QueueResult<Vec<PendingEntry>> {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Err(no_group(stream, group));
        };
        let group_state = state.group_mut(stream, group)?;
        let now = Instant::now();
        let start = query.start.unwrap_or(EntryId::ZERO);
        let end = query.end.unwrap_or(EntryId::new(u64::MAX, u64::MAX));
        if start > end {
            return Ok(Vec::new());
        }

        Ok(group_state
            .pel
            .range(start..=end)
            .filter(|(_, record)| {
                query
                    .consumer
                    .as_deref()
                    .is_none_or(|c| c == record.consumer)
            })
            .map(|(id, record)| PendingEntry {
                id: *id,
                consumer: record.consumer.clone(),
                idle: now.saturating_duration_since(record.delivered_at),
                deliveries: record.deliveries,
            })
            .filter(|entry| entry.idle >= query.min_idle)
            .take(query.count)
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> QueueResult<Vec<Entry>> {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Err(no_group(stream, group));
        };
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        group_state.consumers.insert(consumer.to_string());
        let now = Instant::now();

        let mut claimed = Vec::new();
        for id in ids {
            let Some(record) = group_state.pel.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(record.delivered_at) < min_idle {
                continue;
            }
            let Some(fields) = entries.get(id) else {
                group_state.pel.remove(id);
                continue;
            };
            record.consumer = consumer.to_string();
            record.deliveries += 1;
            record.delivered_at = now;
            claimed.push(Entry {
                id: *id,
                fields: fields.clone(),
            });
        }
        Ok(claimed)
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> QueueResult<usize> {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| state.entries.remove(id).is_some())
            .count())
    }

    async fn len(&self, stream: &str) -> QueueResult<usize> {
        Ok(self
            .lock()
            .get(stream)
            .map(|state| state.entries.len())
            .unwrap_or(0))
    }

    async fn group_info(&self, stream: &str, group: &str) -> QueueResult<Option<GroupInfo>> {
        let streams = self.lock();
        let Some(state) = streams.get(stream) else {
            return Ok(None);
        };
        Ok(state.groups.get(group).map(|g| GroupInfo {
            name: group.to_string(),
            consumers: g.consumers.len(),
            pending: g.pel.len(),
            last_delivered: g.last_delivered,
            lag: Some(state.entries.range(g.last_delivered.successor()..).count()),
        }))
    }
}
