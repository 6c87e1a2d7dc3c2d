//! The log backend trait.

use crate::error::StorageResult;

/// An append-only byte log.
///
/// The journal layer frames its records on top of this trait and owns all
/// interpretation of the bytes.
///
/// # Invariants
///
/// - `append` returns the offset the data starts at, which equals `len()`
///   before the call
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `sync` returns, every appended byte survives process termination
/// - `truncate` only shrinks; it exists for recovery of a torn tail
pub trait LogBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not
    /// entirely inside the log, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes data and metadata durable.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current length of the log in bytes.
    fn len(&self) -> StorageResult<u64>;

    /// Returns true if nothing was ever appended (or everything was cut).
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Cuts the log down to `new_len` bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::StorageError::TruncateBeyondEnd`] when `new_len`
    /// exceeds the current length.
    fn truncate(&mut self, new_len: u64) -> StorageResult<()>;
}
