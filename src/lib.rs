//! # Scanq
//!
//! Distributed scan-job queue on Redis streams.
//!
//! This crate re-exports [`scanq_queue`], which holds the queue itself:
//! producers, consumer-group workers, stale entry reclaim and eviction,
//! request/reply correlation and the backpressure gate. The `scanq` binary
//! lives in `scanq-cli`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scanq::{GroupStart, Priority, QueueDefinition, RedisConfig, StreamQueue};
//! use scanq::log::RedisLog;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct ScanJob {
//!     image: String,
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let definition: QueueDefinition = "queue://scans:scanners/?maxlen=10000".parse()?;
//! let queue: StreamQueue<ScanJob, scanq::FlatCodec, RedisLog> =
//!     StreamQueue::connect_redis(RedisConfig::from_env()?, definition).await?;
//! queue.declare(GroupStart::Beginning).await?;
//! queue.publish(Priority::Low, &ScanJob { image: "alpine:3.20".into() }).await?;
//! # Ok(())
//! # }
//! ```

pub use scanq_queue::*;
