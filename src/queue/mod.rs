//! Durable FIFO of opaque byte records, one per follower backend.

use bytes::Bytes;
use std::path::PathBuf;
use thiserror::Error;

mod file;

pub use file::FileQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid queue file at {path:?}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },

    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    #[error("record too large: {size} bytes")]
    RecordTooLarge { size: usize },
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Crash-safe FIFO byte-record store.
///
/// Records are opaque to the queue and survive process restart. The queue is
/// single-writer (the append path) and single-reader (the replay loop); the
/// implementation must make that pair of accessors safe. Order is strict
/// FIFO: the head is removed only by [`dequeue`](DurableQueue::dequeue).
pub trait DurableQueue: Send + Sync {
    /// Append a record, returning its position in the queue's lifetime.
    fn enqueue(&self, record: &[u8]) -> Result<u64>;

    /// The current head record, or `None` when the queue is empty.
    fn peek(&self) -> Result<Option<Bytes>>;

    /// Remove the head record. A no-op on an empty queue.
    fn dequeue(&self) -> Result<()>;

    /// Number of buffered records.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
