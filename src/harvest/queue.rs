//! Bounded work queue between the harvest scheduler and download workers.
//!
//! Enqueueing waits once the queue is full, so a slow download pool throttles
//! the scheduler instead of losing work. The queue closes when every
//! [`MediaSender`] is dropped; receivers then drain whatever is left and stop.

use thiserror::Error;

use crate::harvest::media::MediaRef;

/// Default backpressure threshold, large enough for one full cycle.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Error types for the work queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Work queue is closed")]
    Closed,
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Create a queue holding at most `capacity` pending items.
pub fn work_queue(capacity: usize) -> (MediaSender, MediaReceiver) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    (MediaSender { tx }, MediaReceiver { rx })
}

/// Producer half of the work queue
#[derive(Debug, Clone)]
pub struct MediaSender {
    tx: flume::Sender<MediaRef>,
}

impl MediaSender {
    /// Push one item, waiting while the queue is at capacity.
    pub async fn enqueue(&self, media: MediaRef) -> QueueResult<()> {
        self.tx.send_async(media).await.map_err(|_| QueueError::Closed)
    }
}

/// Consumer half of the work queue, cloned once per worker
#[derive(Debug, Clone)]
pub struct MediaReceiver {
    rx: flume::Receiver<MediaRef>,
}

impl MediaReceiver {
    /// Next item in FIFO order, or `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<MediaRef> {
        self.rx.recv_async().await.ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
