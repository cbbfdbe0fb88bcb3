//! Redis streams implementation of [`StreamLog`]
//!
//! Commands are issued raw and replies parsed from [`Value`] so that both
//! RESP2 (flat arrays) and RESP3 (maps) servers are understood.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, PoolConfig as PoolSize, Runtime};
use ::redis::{Cmd, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    Entry, EntryId, GroupInfo, GroupStart, PendingEntry, PendingQuery, ReadCursor, StreamLog,
};
use crate::codec::{Fields, MALFORMED_FIELD};
use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};

/// Redis-backed log on a deadpool connection pool
pub struct RedisLog {
    pool: Pool,
    config: RedisConfig,
}

impl std::fmt::Debug for RedisLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLog")
            .field("url", &self.config.url)
            .field("pool_size", &self.config.pool_size)
            .finish()
    }
}

impl RedisLog {
    /// Connect to `config.url`, retrying a bounded number of times.
    ///
    /// Each attempt builds the pool and round-trips a `PING`. When every
    /// attempt fails the error is [`QueueError::ConnectRetriesExhausted`].
    pub async fn connect(config: RedisConfig) -> QueueResult<Self> {
        config.validate()?;

        let mut last_error = String::new();
        for attempt in 1..=config.connect_attempts {
            match Self::try_connect(&config).await {
                Ok(pool) => {
                    info!(
                        url = %config.url,
                        attempt,
                        "Connected to Redis"
                    );
                    return Ok(Self { pool, config });
                }
                Err(e) => {
                    warn!(
                        url = %config.url,
                        attempt,
                        max_attempts = config.connect_attempts,
                        error = %e,
                        "Redis connection attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < config.connect_attempts {
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }

        Err(QueueError::ConnectRetriesExhausted {
            attempts: config.connect_attempts,
            reason: last_error,
        })
    }

    async fn try_connect(config: &RedisConfig) -> QueueResult<Pool> {
        let mut pool_config = PoolConfig::from_url(config.url.expose());
        pool_config.pool = Some(PoolSize::new(config.pool_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::ConnectionFailed(format!("Failed to create pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        tokio::time::timeout(
            config.command_timeout,
            ::redis::cmd("PING").query_async::<String>(&mut *conn),
        )
        .await
        .map_err(|_| QueueError::ConnectionFailed("PING timed out".to_string()))?
        .map_err(|e| QueueError::ConnectionFailed(format!("PING failed: {}", e)))?;

        Ok(pool)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    async fn get_connection(&self) -> QueueResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
    }

    /// Run one command on a pooled connection, bounded by the command timeout
    /// plus whatever time the command itself is allowed to block.
    async fn query(&self, cmd: &Cmd, block: Option<Duration>) -> QueueResult<Value> {
        let mut conn = self.get_connection().await?;
        let limit = self.config.command_timeout + block.unwrap_or_default();
        with_timeout(limit, cmd.query_async::<Value>(&mut *conn)).await
    }

    /// Counts entries after `after` when the server does not report lag
    async fn count_after(&self, stream: &str, after: EntryId) -> QueueResult<usize> {
        let mut cmd = ::redis::cmd("XRANGE");
        cmd.arg(stream).arg(format!("({}", after)).arg("+");
        let reply = self.query(&cmd, None).await?;
        Ok(as_array(&reply).map(|entries| entries.len()).unwrap_or(0))
    }
}

async fn with_timeout<F>(limit: Duration, fut: F) -> QueueResult<Value>
where
    F: Future<Output = ::redis::RedisResult<Value>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(QueueError::from),
        Err(_) => Err(QueueError::BackendError(format!(
            "Redis command timed out after {:?}",
            limit
        ))),
    }
}

fn block_millis(block: Duration) -> u64 {
    // BLOCK 0 means forever
    (block.as_millis() as u64).max(1)
}

#[async_trait]
impl StreamLog for RedisLog {
    async fn ping(&self) -> QueueResult<()> {
        let reply = self.query(&::redis::cmd("PING"), None).await?;
        match as_string(&reply).as_deref() {
            Some("PONG") => Ok(()),
            other => Err(QueueError::BackendError(format!(
                "unexpected PING reply: {:?}",
                other
            ))),
        }
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> QueueResult<bool> {
        let mut cmd = ::redis::cmd("XGROUP");
        cmd.arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start.as_arg())
            .arg("MKSTREAM");

        match self.query(&cmd, None).await {
            Ok(_) => {
                debug!(stream = %stream, group = %group, "Created consumer group");
                Ok(true)
            }
            Err(QueueError::BackendError(msg)) if msg.contains("BUSYGROUP") => Ok(false),
            Err(e) => Err(e),
        }
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

        let mut cmd = ::redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (name, value) in fields {
            cmd.arg(name).arg(value);
        }

        let reply = self.query(&cmd, None).await?;
        as_string(&reply)
            .ok_or_else(|| QueueError::BackendError(format!("unexpected XADD reply: {:?}", reply)))?
            .parse()
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
        let mut cmd = ::redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));

        // The server ignores BLOCK for explicit ids
        let block = match cursor {
            ReadCursor::New => block,
            ReadCursor::Backlog(_) => None,
        };
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block_millis(block));
        }

        cmd.arg("STREAMS").arg(stream);
        match cursor {
            ReadCursor::New => cmd.arg(">"),
            ReadCursor::Backlog(after) => cmd.arg(after.to_string()),
        };

        let reply = self.query(&cmd, block).await?;
        parse_read_reply(&reply, stream)
    }

    async fn read(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<Entry>> {
        let mut cmd = ::redis::cmd("XREAD");
        cmd.arg("COUNT").arg(count.max(1));
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block_millis(block));
        }
        cmd.arg("STREAMS").arg(stream).arg(after.to_string());

        let reply = self.query(&cmd, block).await?;
        parse_read_reply(&reply, stream)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> QueueResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = ::redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let reply = self.query(&cmd, None).await?;
        as_usize(&reply)
            .ok_or_else(|| QueueError::BackendError(format!("unexpected XACK reply: {:?}", reply)))
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        query: &PendingQuery,
    ) -> QueueResult<Vec<PendingEntry>> {
        let mut cmd = ::redis::cmd("XPENDING");
        cmd.arg(stream).arg(group);
        if !query.min_idle.is_zero() {
            cmd.arg("IDLE").arg(query.min_idle.as_millis() as u64);
        }
        cmd.arg(query.start.map_or_else(|| "-".to_string(), |id| id.to_string()))
            .arg(query.end.map_or_else(|| "+".to_string(), |id| id.to_string()))
            .arg(query.count.max(1));
        if let Some(consumer) = &query.consumer {
            cmd.arg(consumer);
        }

        let reply = self.query(&cmd, None).await?;
        parse_pending_reply(&reply)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> QueueResult<Vec<Entry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = ::redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64);
        for id in ids {
            cmd.arg(id.to_string());
        }

        let reply = self.query(&cmd, None).await?;
        let mut entries = parse_entries(&reply)?;
        // Older servers answer deleted entries with nil fields
        entries.retain(|entry| !entry.is_tombstone());
        Ok(entries)
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> QueueResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = ::redis::cmd("XDEL");
        cmd.arg(stream);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let reply = self.query(&cmd, None).await?;
        as_usize(&reply)
            .ok_or_else(|| QueueError::BackendError(format!("unexpected XDEL reply: {:?}", reply)))
    }

    async fn len(&self, stream: &str) -> QueueResult<usize> {
        let mut cmd = ::redis::cmd("XLEN");
        cmd.arg(stream);
        let reply = self.query(&cmd, None).await?;
        as_usize(&reply)
            .ok_or_else(|| QueueError::BackendError(format!("unexpected XLEN reply: {:?}", reply)))
    }

    async fn group_info(&self, stream: &str, group: &str) -> QueueResult<Option<GroupInfo>> {
        let mut cmd = ::redis::cmd("XINFO");
        cmd.arg("GROUPS").arg(stream);

        let reply = match self.query(&cmd, None).await {
            Ok(reply) => reply,
            Err(QueueError::BackendError(msg)) if msg.contains("no such key") => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(mut info) = parse_groups_reply(&reply)?
            .into_iter()
            .find(|info| info.name == group)
        else {
            return Ok(None);
        };

        if info.lag.is_none() {
            info.lag = Some(self.count_after(stream, info.last_delivered).await?);
        }
        Ok(Some(info))
    }

    async fn close(&self) {
        self.pool.close();
        debug!(url = %self.config.url, "Closed Redis pool");
    }
}

fn unexpected(what: &str, value: &Value) -> QueueError {
    QueueError::BackendError(format!("unexpected {} reply: {:?}", what, value))
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        Value::VerbatimString { text, .. } => Some(text.clone()),
        Value::Okay => Some("OK".to_string()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_usize(value: &Value) -> Option<usize> {
    match value {
        Value::Int(n) => usize::try_from(*n).ok(),
        other => as_string(other)?.parse().ok(),
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Int(n) => u64::try_from(*n).ok(),
        other => as_string(other)?.parse().ok(),
    }
}

fn as_array(value: &Value) -> Option<&[Value]> {
    match value {
        Value::Array(items) | Value::Set(items) => Some(items),
        _ => None,
    }
}

/// Key/value pairs of a RESP3 map or a flat RESP2 array
fn as_pairs(value: &Value) -> Option<Vec<(&Value, &Value)>> {
    match value {
        Value::Map(pairs) => Some(pairs.iter().map(|(k, v)| (k, v)).collect()),
        Value::Array(items) if items.len() % 2 == 0 => Some(
            items
                .chunks_exact(2)
                .map(|pair| (&pair[0], &pair[1]))
                .collect(),
        ),
        _ => None,
    }
}

/// Text of a field name or value, and whether it was valid UTF-8
fn as_text_lossy(value: &Value) -> Option<(String, bool)> {
    match value {
        Value::BulkString(bytes) => Some(match std::str::from_utf8(bytes) {
            Ok(text) => (text.to_string(), true),
            Err(_) => (String::from_utf8_lossy(bytes).into_owned(), false),
        }),
        other => as_string(other).map(|text| (text, true)),
    }
}

/// Field list of one entry. Non-UTF-8 names or values are kept lossily and
/// flagged under [`MALFORMED_FIELD`], so only that entry fails to decode.
fn parse_fields(value: &Value) -> QueueResult<Fields> {
    if matches!(value, Value::Nil) {
        return Ok(Fields::new());
    }
    let pairs = as_pairs(value).ok_or_else(|| unexpected("field list", value))?;
    let mut fields = Fields::new();
    let mut malformed = Vec::new();
    for (k, v) in pairs {
        let (Some((name, name_ok)), Some((text, text_ok))) = (as_text_lossy(k), as_text_lossy(v))
        else {
            return Err(unexpected("field pair", value));
        };
        if !(name_ok && text_ok) {
            malformed.push(name.clone());
        }
        fields.insert(name, text);
    }
    if !malformed.is_empty() {
        fields.insert(
            MALFORMED_FIELD.to_string(),
            format!("field(s) not valid UTF-8: {}", malformed.join(", ")),
        );
    }
    Ok(fields)
}

fn parse_entry(value: &Value) -> QueueResult<Option<Entry>> {
    if matches!(value, Value::Nil) {
        return Ok(None);
    }
    let items = as_array(value).ok_or_else(|| unexpected("entry", value))?;
    let [id, fields] = items else {
        return Err(unexpected("entry", value));
    };
    let id = as_string(id)
        .ok_or_else(|| unexpected("entry id", value))?
        .parse()?;
    Ok(Some(Entry {
        id,
        fields: parse_fields(fields)?,
    }))
}

/// `[[id, [f, v, ...]], ...]`
fn parse_entries(value: &Value) -> QueueResult<Vec<Entry>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        _ => {
            let items = as_array(value).ok_or_else(|| unexpected("entry list", value))?;
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                if let Some(entry) = parse_entry(item)? {
                    entries.push(entry);
                }
            }
            Ok(entries)
        }
    }
}

/// `XREAD`/`XREADGROUP` reply: nil on timeout, otherwise one
/// `[stream, entries]` pair per stream (a map under RESP3).
fn parse_read_reply(value: &Value, stream: &str) -> QueueResult<Vec<Entry>> {
    if matches!(value, Value::Nil) {
        return Ok(Vec::new());
    }

    let per_stream: Vec<(&Value, &Value)> = match value {
        Value::Map(pairs) => pairs.iter().map(|(k, v)| (k, v)).collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| match as_array(item) {
                Some([name, entries]) => Ok((name, entries)),
                _ => Err(unexpected("stream reply", item)),
            })
            .collect::<QueueResult<_>>()?,
        _ => return Err(unexpected("read", value)),
    };

    for (name, entries) in per_stream {
        if as_string(name).as_deref() == Some(stream) {
            return parse_entries(entries);
        }
    }
    Ok(Vec::new())
}

/// Extended `XPENDING` reply: `[[id, consumer, idle_ms, deliveries], ...]`
fn parse_pending_reply(value: &Value) -> QueueResult<Vec<PendingEntry>> {
    let Some(items) = as_array(value) else {
        return match value {
            Value::Nil => Ok(Vec::new()),
            _ => Err(unexpected("XPENDING", value)),
        };
    };

    items
        .iter()
        .map(|item| {
            let Some([id, consumer, idle, deliveries]) = as_array(item) else {
                return Err(unexpected("XPENDING entry", item));
            };
            let id = as_string(id)
                .ok_or_else(|| unexpected("XPENDING id", item))?
                .parse()?;
            Ok(PendingEntry {
                id,
                consumer: as_string(consumer)
                    .ok_or_else(|| unexpected("XPENDING consumer", item))?,
                idle: Duration::from_millis(
                    as_u64(idle).ok_or_else(|| unexpected("XPENDING idle", item))?,
                ),
                deliveries: as_u64(deliveries)
                    .ok_or_else(|| unexpected("XPENDING deliveries", item))?,
            })
        })
        .collect()
}

/// `XINFO GROUPS` reply: one key/value record per group. `lag` is only
/// reported by Redis 7+ and may be nil when the server cannot compute it.
fn parse_groups_reply(value: &Value) -> QueueResult<Vec<GroupInfo>> {
    let items = as_array(value).ok_or_else(|| unexpected("XINFO GROUPS", value))?;
    items
        .iter()
        .map(|item| {
            let pairs = as_pairs(item).ok_or_else(|| unexpected("XINFO group", item))?;
            let mut info = GroupInfo {
                name: String::new(),
                consumers: 0,
                pending: 0,
                last_delivered: EntryId::ZERO,
                lag: None,
            };
            for (key, val) in pairs {
                match as_string(key).as_deref() {
                    Some("name") => info.name = as_string(val).unwrap_or_default(),
                    Some("consumers") => info.consumers = as_usize(val).unwrap_or_default(),
                    Some("pending") => info.pending = as_usize(val).unwrap_or_default(),
                    Some("last-delivered-id") => {
                        if let Some(id) = as_string(val) {
                            info.last_delivered = id.parse()?;
                        }
                    }
                    Some("lag") => info.lag = as_usize(val),
                    _ => {}
                }
            }
            Ok(info)
        })
        .collect()
}
