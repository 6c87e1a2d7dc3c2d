//! In-memory log backend.

use crate::backend::LogBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// A log kept entirely in memory.
///
/// Clones share the same bytes, so a server that evicts a folder from its
/// cache can hand the very same log to the folder when it is reopened.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log holding `data`, as if it had been appended before a crash.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the raw log bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl LogBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_len > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_len,
                size,
            });
        }
        data.truncate(new_len as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut log = InMemoryBackend::new();
        assert_eq!(log.append(b"hello").unwrap(), 0);
        assert_eq!(log.append(b" world").unwrap(), 5);
        assert_eq!(log.len().unwrap(), 11);
        assert_eq!(log.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut log = InMemoryBackend::new();
        log.append(b"hello").unwrap();

        assert!(matches!(
            log.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            log.read_at(10, 1),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(log.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn clones_share_bytes() {
        let mut writer = InMemoryBackend::new();
        let reader = writer.clone();
        writer.append(b"shared").unwrap();
        assert_eq!(reader.data(), b"shared");
    }

    #[test]
    fn truncate_only_shrinks() {
        let mut log = InMemoryBackend::with_data(b"hello world".to_vec());
        log.truncate(5).unwrap();
        assert_eq!(log.data(), b"hello");

        assert!(matches!(
            log.truncate(100),
            Err(StorageError::TruncateBeyondEnd { size: 5, .. })
        ));
        assert!(!log.is_empty().unwrap());
        log.truncate(0).unwrap();
        assert!(log.is_empty().unwrap());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn appends_read_back_at_their_offsets(
                chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..20)
            ) {
                let mut log = InMemoryBackend::new();
                let offsets: Vec<u64> = chunks.iter().map(|c| log.append(c).unwrap()).collect();
                for (chunk, offset) in chunks.iter().zip(offsets) {
                    prop_assert_eq!(&log.read_at(offset, chunk.len()).unwrap(), chunk);
                }
                let total: usize = chunks.iter().map(Vec::len).sum();
                prop_assert_eq!(log.len().unwrap(), total as u64);
            }
        }
    }
}
