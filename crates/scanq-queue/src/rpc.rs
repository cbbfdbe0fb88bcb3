//! Request/reply over two streams
//!
//! A request is an ordinary entry on the request stream; its log-assigned id
//! is the correlation key. A server publishes the reply on the reply stream
//! with that id in the `__correlation_id` field, and the caller scans the
//! reply stream from its beginning until the matching reply shows up.
//!
//! No correlation table is kept anywhere. The price is that a lookup reads
//! every reply retained since the start of the stream, so the reply stream
//! should carry a `maxlen`.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{CORRELATION_FIELD, Codec, FlatCodec};
use crate::consumer::TaskHandler;
use crate::error::{HandlerError, QueueError, QueueResult};
use crate::log::{EntryId, GroupStart, MemoryLog, StreamLog};
use crate::stream::{Priority, StreamQueue, TaskMessage};

/// Configuration for Request/Reply pattern
#[derive(Debug, Clone)]
pub struct RequestReplyConfig {
    /// Group servers join on the request stream
    pub group: String,
    /// Consumer name of this server instance
    pub consumer: String,
    /// Block window of a server read
    pub block: Duration,
    /// Timeout of [`RequestReply::request_reply`]
    pub default_timeout: Duration,
    /// Replies fetched per read while scanning
    pub scan_batch: usize,
}

impl Default for RequestReplyConfig {
    fn default() -> Self {
        Self {
            group: "rpc".to_string(),
            consumer: "server-1".to_string(),
            block: Duration::from_secs(5),
            default_timeout: Duration::from_secs(30),
            scan_batch: 100,
        }
    }
}

impl RequestReplyConfig {
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Computes the reply to one request
#[async_trait]
pub trait RequestHandler<Req, Resp>: Send + Sync {
    async fn handle(&self, request: Req) -> Result<Resp, HandlerError>;
}

#[async_trait]
impl<Req, Resp, F, Fut> RequestHandler<Req, Resp> for F
where
    Req: Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send,
{
    async fn handle(&self, request: Req) -> Result<Resp, HandlerError> {
        (self)(request).await
    }
}

/// Request/Reply coordinator
pub struct RequestReply<Req, Resp, C = FlatCodec, L = MemoryLog> {
    requests: StreamQueue<Req, C, L>,
    replies: StreamQueue<Resp, C, L>,
    config: RequestReplyConfig,
}

impl<Req, Resp, C, L> Clone for RequestReply<Req, Resp, C, L> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            replies: self.replies.clone(),
            config: self.config.clone(),
        }
    }
}

impl<Req, Resp, C, L> RequestReply<Req, Resp, C, L>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
    C: Codec<Req> + Codec<Resp>,
    L: StreamLog,
{
    pub fn new(
        requests: StreamQueue<Req, C, L>,
        replies: StreamQueue<Resp, C, L>,
        config: RequestReplyConfig,
    ) -> Self {
        Self {
            requests,
            replies,
            config,
        }
    }

    /// The same streams under another server consumer name
    pub fn with_consumer(&self, consumer: impl Into<String>) -> Self {
        Self {
            config: self.config.clone().with_consumer(consumer),
            ..self.clone()
        }
    }

    pub fn config(&self) -> &RequestReplyConfig {
        &self.config
    }

    pub fn requests(&self) -> &StreamQueue<Req, C, L> {
        &self.requests
    }

    pub fn replies(&self) -> &StreamQueue<Resp, C, L> {
        &self.replies
    }

    /// Create the server group on the request stream
    pub async fn declare(&self) -> QueueResult<bool> {
        self.requests
            .log()
            .create_group(self.requests.stream(), &self.config.group, GroupStart::Beginning)
            .await
    }

    /// Send a request and wait up to the default timeout for its reply
    pub async fn request_reply(&self, request: &Req) -> QueueResult<Resp> {
        self.request_reply_timeout(request, self.config.default_timeout)
            .await
    }

    pub async fn request_reply_timeout(&self, request: &Req, timeout: Duration) -> QueueResult<Resp> {
        let correlation_id = self.send_request(request).await?;
        self.receive_response(correlation_id, timeout).await
    }

    /// Publish a request. Its entry id is the correlation id.
    pub async fn send_request(&self, request: &Req) -> QueueResult<EntryId> {
        let id = self.requests.publish(Priority::default(), request).await?;
        debug!(stream = %self.requests.stream(), correlation_id = %id, "Sent request");
        Ok(id)
    }

    /// Scan the reply stream from its start for the reply to `correlation_id`
    pub async fn receive_response(
        &self,
        correlation_id: EntryId,
        timeout: Duration,
    ) -> QueueResult<Resp> {
        let deadline = Instant::now() + timeout;
        let wanted = correlation_id.to_string();
        let mut cursor = EntryId::ZERO;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(correlation_id = %wanted, ?timeout, "No reply before deadline");
                return Err(QueueError::Timeout(timeout));
            }

            let batch = self
                .replies
                .log()
                .read(
                    self.replies.stream(),
                    cursor,
                    self.config.scan_batch,
                    Some(remaining),
                )
                .await?;

            for entry in &batch {
                cursor = entry.id;
                if entry.fields.get(CORRELATION_FIELD) == Some(&wanted) {
                    let task = self.replies.to_task(
                        self.replies.group(),
                        entry,
                        1,
                        Duration::ZERO,
                    )?;
                    debug!(correlation_id = %wanted, reply_id = %entry.id, "Received reply");
                    return Ok(task.payload);
                }
            }
        }
    }

    /// Serve requests as the configured consumer until a block window
    /// passes with no new request. Ends with [`QueueError::Timeout`].
    pub async fn process_request<H>(&self, handler: &H) -> QueueResult<()>
    where
        H: RequestHandler<Req, Resp> + ?Sized,
    {
        let publisher = ReplyPublisher {
            replies: &self.replies,
            handler,
        };
        self.requests
            .subscribe(
                &self.config.group,
                &self.config.consumer,
                self.config.block,
                &publisher,
            )
            .await
    }

    /// Serve requests until `token` is cancelled
    pub async fn serve_until<H>(&self, handler: &H, token: &CancellationToken) -> QueueResult<()>
    where
        H: RequestHandler<Req, Resp> + ?Sized,
    {
        let publisher = ReplyPublisher {
            replies: &self.replies,
            handler,
        };
        self.requests
            .subscribe_until(
                &self.config.group,
                &self.config.consumer,
                self.config.block,
                &publisher,
                token,
            )
            .await
    }
}

/// Runs a request handler and publishes its reply; the request is
/// acknowledged only after the reply is in the log.
struct ReplyPublisher<'a, Resp, C, L, H: ?Sized> {
    replies: &'a StreamQueue<Resp, C, L>,
    handler: &'a H,
}

#[async_trait]
impl<Req, Resp, C, L, H> TaskHandler<Req> for ReplyPublisher<'_, Resp, C, L, H>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
    C: Codec<Resp>,
    L: StreamLog,
    H: RequestHandler<Req, Resp> + ?Sized,
{
    async fn handle(&self, task: TaskMessage<Req>) -> Result<(), HandlerError> {
        let correlation_id = task.id;
        let priority = task.priority;
        let reply = self.handler.handle(task.payload).await?;

        let mut fields = self.replies.encode(priority, &reply)?;
        fields.insert(CORRELATION_FIELD.to_string(), correlation_id.to_string());
        let reply_id = self.replies.append_fields(&fields).await?;
        self.replies.metrics().record_reply();
        debug!(correlation_id = %correlation_id, reply_id = %reply_id, "Published reply");
        Ok(())
    }
}
