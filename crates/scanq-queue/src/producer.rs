//! Enqueue API

use tracing::{debug, warn};

use crate::backpressure::QueueLimit;
use crate::codec::{Codec, Fields, PRIORITY_FIELD};
use crate::error::QueueResult;
use crate::log::{EntryId, StreamLog};
use crate::stream::{Priority, StreamQueue};

impl<T, C, L> StreamQueue<T, C, L>
where
    T: Send + Sync + 'static,
    C: Codec<T>,
    L: StreamLog,
{
    /// Encode `payload` and append it to the stream.
    ///
    /// The stream is trimmed approximately to the queue's `max_len`. The
    /// returned id orders the entry in the stream and doubles as the
    /// correlation key for request/reply. Failures are not retried here.
    pub async fn publish(&self, priority: Priority, payload: &T) -> QueueResult<EntryId> {
        let fields = self.encode(priority, payload)?;
        self.append_fields(&fields).await
    }

    /// Publish unless `gate` rejects the payload, in which case `None`
    pub async fn publish_gated(
        &self,
        gate: &QueueLimit<T>,
        priority: Priority,
        payload: &T,
    ) -> QueueResult<Option<EntryId>> {
        if !gate.admit(self, payload).await? {
            return Ok(None);
        }
        self.publish(priority, payload).await.map(Some)
    }

    pub(crate) fn encode(&self, priority: Priority, payload: &T) -> QueueResult<Fields> {
        let mut fields = self.codec().encode(payload)?;
        fields.insert(PRIORITY_FIELD.to_string(), priority.to_string());
        Ok(fields)
    }

    pub(crate) async fn append_fields(&self, fields: &Fields) -> QueueResult<EntryId> {
        match self
            .log()
            .append(self.stream(), fields, self.definition().trim_len())
            .await
        {
            Ok(id) => {
                self.metrics().record_publish();
                debug!(stream = %self.stream(), id = %id, "Published entry");
                Ok(id)
            }
            Err(e) => {
                warn!(stream = %self.stream(), error = %e, "Publish failed");
                Err(e)
            }
        }
    }
}
