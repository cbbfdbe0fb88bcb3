//! Prefer-high merge of two channels
//!
//! [`priority_merge`] is a liveness bias, not a scheduler: a high item is
//! forwarded ahead of low items whenever one is already waiting, but low
//! items that reached the output earlier stay ahead of it, and nothing
//! reorders entries already appended to a stream.

use tokio::sync::mpsc;
use tracing::debug;

/// Forward items from `high` and `low` into `out`, taking from `high`
/// whenever it has an item ready.
///
/// When `high` is momentarily empty the merge waits on both inputs. It stops
/// once both inputs are closed and drained, or when `out` is closed, and
/// returns the number of items forwarded.
pub async fn priority_merge<T>(
    mut high: mpsc::Receiver<T>,
    mut low: mpsc::Receiver<T>,
    out: mpsc::Sender<T>,
) -> usize {
    let mut forwarded = 0;
    let mut high_open = true;
    let mut low_open = true;

    while high_open || low_open {
        let item = match high.try_recv() {
            Ok(item) => Some(item),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                high_open = false;
                None
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
        };

        let item = match item {
            Some(item) => item,
            None => {
                tokio::select! {
                    item = high.recv(), if high_open => match item {
                        Some(item) => item,
                        None => {
                            high_open = false;
                            continue;
                        }
                    },
                    item = low.recv(), if low_open => match item {
                        Some(item) => item,
                        None => {
                            low_open = false;
                            continue;
                        }
                    },
                    else => break,
                }
            }
        };

        if out.send(item).await.is_err() {
            debug!(forwarded, "Priority merge output closed");
            break;
        }
        forwarded += 1;
    }

    forwarded
}
