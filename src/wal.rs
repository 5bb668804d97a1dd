//! Write-ahead log hook consumed by the buffer pool.

use crate::error::BufferResult;

/// Durability hook honored before a dirty page is written back on eviction
/// or deletion.
///
/// The buffer pool never inspects log contents. Forcing the log ahead of a
/// data write keeps the usual WAL ordering: log records describing a page
/// reach disk before the page itself does.
pub trait LogManager: Send + Sync {
    /// Force buffered log records to durable storage.
    fn flush(&self) -> BufferResult<()>;
}
