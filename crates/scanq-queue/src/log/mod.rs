//! Append-only log abstraction
//!
//! [`StreamLog`] is the single seam between the queue and the replicated log
//! that backs it. Every operation maps onto one stream command:
//!
//! | method         | command                                  |
//! |----------------|------------------------------------------|
//! | `create_group` | `XGROUP CREATE <s> <g> <start> MKSTREAM` |
//! | `append`       | `XADD <s> [MAXLEN ~ n] * f v ...`        |
//! | `read_group`   | `XREADGROUP GROUP <g> <c> ... STREAMS`   |
//! | `read`         | `XREAD ... STREAMS <s> <id>`             |
//! | `ack`          | `XACK`                                   |
//! | `pending`      | `XPENDING <s> <g> IDLE <ms> - + <n>`     |
//! | `claim`        | `XCLAIM`                                 |
//! | `delete`       | `XDEL`                                   |
//! | `len`          | `XLEN`                                   |
//! | `group_info`   | `XINFO GROUPS`                           |
//!
//! [`MemoryLog`] implements the same semantics in-process; `RedisLog`
//! (feature `redis`) talks to a real server.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::codec::Fields;
use crate::error::{QueueError, QueueResult};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryLog;
#[cfg(feature = "redis")]
pub use self::redis::RedisLog;

/// Log-assigned entry identifier, `<milliseconds>-<sequence>`.
///
/// Identifiers are strictly increasing in append order, so ordering by
/// `EntryId` is ordering by position in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    /// The smallest possible identifier (`0-0`), positioned before any entry
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn ms(&self) -> u64 {
        self.ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Smallest identifier strictly greater than this one
    pub fn successor(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms.saturating_add(1),
                seq: 0,
            },
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueError::InvalidEntryId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One immutable record of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    pub fields: Fields,
}

impl Entry {
    /// A pending reference whose entry was deleted from the stream
    /// (trimmed or evicted) comes back with no fields.
    pub fn is_tombstone(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStart {
    /// Deliver every entry already in the stream (`0`)
    #[default]
    Beginning,
    /// Deliver only entries appended after the group exists (`$`)
    Latest,
}

impl GroupStart {
    pub fn as_arg(&self) -> &'static str {
        match self {
            GroupStart::Beginning => "0",
            GroupStart::Latest => "$",
        }
    }
}

/// Cursor for a group read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group (`>`)
    New,
    /// This consumer's own pending entries with an id greater than the given one
    Backlog(EntryId),
}

/// Delivery bookkeeping for an entry that was delivered but not acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    /// Time since the entry was last delivered
    pub idle: Duration,
    /// Number of times the entry has been delivered
    pub deliveries: u64,
}

/// Filter for [`StreamLog::pending`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    /// Only entries idle at least this long
    pub min_idle: Duration,
    /// Inclusive lower bound
    pub start: Option<EntryId>,
    /// Inclusive upper bound
    pub end: Option<EntryId>,
    pub count: usize,
    /// Only entries owned by this consumer
    pub consumer: Option<String>,
}

impl PendingQuery {
    pub fn new(count: usize) -> Self {
        Self {
            min_idle: Duration::ZERO,
            start: None,
            end: None,
            count,
            consumer: None,
        }
    }

    /// Query the bookkeeping of exactly one entry
    pub fn single(id: EntryId) -> Self {
        Self {
            start: Some(id),
            end: Some(id),
            ..Self::new(1)
        }
    }

    pub fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }
}

/// Per-group summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    /// Delivered but unacknowledged entries
    pub pending: usize,
    pub last_delivered: EntryId,
    /// Entries not yet delivered to the group, when the log can tell
    pub lag: Option<usize>,
}

/// Operations a replicated append-only log must provide
#[async_trait]
pub trait StreamLog: Send + Sync + 'static {
    /// Round-trip to the log
    async fn ping(&self) -> QueueResult<()>;

    /// Create the stream and the group if absent.
    ///
    /// Returns `false` when the group already existed, which is not an error.
    async fn create_group(&self, stream: &str, group: &str, start: GroupStart)
    -> QueueResult<bool>;

    /// Append a record, trimming the stream to roughly `max_len` entries
    async fn append(
        &self,
        stream: &str,
        fields: &Fields,
        max_len: Option<usize>,
    ) -> QueueResult<EntryId>;

    /// Group read. Only [`ReadCursor::New`] blocks, for up to `block`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<Entry>>;

    /// Plain read of entries with an id greater than `after`
    async fn read(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<Entry>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> QueueResult<usize>;

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        query: &PendingQuery,
    ) -> QueueResult<Vec<PendingEntry>>;

    /// Reassign pending entries idle at least `min_idle` to `consumer`.
    ///
    /// Each claimed entry has its delivery count incremented and its idle
    /// clock reset. Entries deleted from the stream are dropped from the
    /// pending list and not returned.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> QueueResult<Vec<Entry>>;

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> QueueResult<usize>;

    async fn len(&self, stream: &str) -> QueueResult<usize>;

    async fn group_info(&self, stream: &str, group: &str) -> QueueResult<Option<GroupInfo>>;

    /// Release backend resources
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_parse_and_display() {
        let id: EntryId = "1700000000000-7".parse().unwrap();
        assert_eq!(id.ms(), 1_700_000_000_000);
        assert_eq!(id.seq(), 7);
        assert_eq!(id.to_string(), "1700000000000-7");

        let bare: EntryId = "42".parse().unwrap();
        assert_eq!(bare, EntryId::new(42, 0));
    }

    #[test]
    fn test_entry_id_rejects_garbage() {
        assert!("".parse::<EntryId>().is_err());
        assert!("abc-1".parse::<EntryId>().is_err());
        assert!("1-x".parse::<EntryId>().is_err());
        assert!(">".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_ordering() {
        let a = EntryId::new(5, 9);
        let b = EntryId::new(6, 0);
        assert!(a < b);
        assert!(a < a.successor());
        assert_eq!(EntryId::new(1, u64::MAX).successor(), EntryId::new(2, 0));
    }

    #[test]
    fn test_entry_id_serde_as_string() {
        let id = EntryId::new(10, 2);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"10-2\"");
        let back: EntryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_pending_query_single() {
        let id = EntryId::new(3, 1);
        let query = PendingQuery::single(id);
        assert_eq!(query.start, Some(id));
        assert_eq!(query.end, Some(id));
        assert_eq!(query.count, 1);
    }
}
