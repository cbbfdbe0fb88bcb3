//! # Scanq Queue
//!
//! Typed task queue over an append-only log with consumer groups.
//!
//! Scan jobs (or any serializable payload) are appended to a stream and
//! fanned out to workers that join a consumer group under distinct names.
//! The log guarantees each entry is owned by one consumer at a time; this
//! crate adds the rest:
//!
//! - **Codec**: payloads travel as flat field records, see [`FlatCodec`]
//! - **Workers**: backlog-first subscribe loop, ack on success, [`WorkerPool`]
//! - **Reclaim**: reassign idle entries, evict entries past `maxretry`
//! - **Request/Reply**: correlation by the request's own entry id
//! - **Flow control**: [`QueueLimit`] gate and [`priority_merge`]
//! - **Backends**: in-process [`MemoryLog`], Redis streams with the `redis` feature
//!
//! ## Example
//!
//! ```rust,no_run
//! use scanq_queue::{GroupStart, HandlerError, Priority, QueueDefinition, StreamQueue, TaskMessage};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct ScanJob {
//!     image: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let definition: QueueDefinition = "queue://scans:scanners/?maxlen=10000&maxretry=3".parse()?;
//!     let queue: StreamQueue<ScanJob> = StreamQueue::in_memory(definition);
//!     queue.declare(GroupStart::Beginning).await?;
//!
//!     queue.publish(Priority::High, &ScanJob { image: "nginx:1.25".into() }).await?;
//!
//!     let handler = |task: TaskMessage<ScanJob>| async move {
//!         println!("scanning {} (attempt {})", task.payload.image, task.retry_count);
//!         Ok::<(), HandlerError>(())
//!     };
//!     let result = queue
//!         .subscribe("scanners", "worker-1", Duration::from_secs(1), &handler)
//!         .await;
//!     assert!(result.unwrap_err().is_timeout());
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod log;
pub mod metrics;
pub mod priority;
pub mod producer;
pub mod reclaim;
pub mod rpc;
pub mod stream;

pub use backpressure::{
    BackpressureConfig, BackpressureMonitor, BackpressureSignal, BackpressureStats, QueueLimit,
};
pub use codec::{Codec, Fields, FlatCodec, JsonCodec};
pub use config::{Dsn, QueueDefinition, RedisConfig};
pub use consumer::{TaskHandler, WorkerPool};
pub use error::{HandlerError, QueueError, QueueResult};
pub use log::{
    Entry, EntryId, GroupInfo, GroupStart, MemoryLog, PendingEntry, PendingQuery, ReadCursor,
    StreamLog,
};
pub use metrics::{LatencyStats, QueueMetrics, QueueMetricsCollector};
pub use priority::priority_merge;
pub use reclaim::{QueueState, REAPER_CONSUMER, Reaper, ReaperConfig};
pub use rpc::{RequestHandler, RequestReply, RequestReplyConfig};
pub use stream::{Priority, StreamQueue, TaskMessage};

#[cfg(feature = "redis")]
pub use log::RedisLog;
