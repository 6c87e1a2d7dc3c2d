//! Streaming journal record iterator.
//!
//! Reads records one by one from the log without loading the whole journal.
//!
//! - A truncated header or body at the tail is a clean end of journal: the
//!   process crashed mid-append and the partial record was never
//!   acknowledged.
//! - A checksum mismatch, bad magic or unknown action is corruption and
//!   stops iteration with an error.

use crate::error::CoreResult;
use crate::journal::record::{decode_record, RecordHeader, HEADER_SIZE};
use mdir_protocol::Patch;
use mdir_storage::LogBackend;

/// Where a record lives in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// Byte offset of the record.
    pub offset: u64,
    /// Total record length.
    pub len: usize,
}

/// An iterator over `(location, patch)` pairs.
pub struct JournalIterator<'a> {
    backend: &'a dyn LogBackend,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> JournalIterator<'a> {
    /// Starts iterating at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log size cannot be read.
    pub fn new(backend: &'a dyn LogBackend, start_offset: u64) -> CoreResult<Self> {
        Ok(Self {
            backend,
            total_size: backend.len()?,
            offset: start_offset,
            finished: false,
        })
    }

    /// Offset just past the last record returned so far.
    ///
    /// After iteration ends without error this is where the valid journal
    /// ends; any bytes beyond it are a torn tail.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<(RecordLocation, Patch)>> {
        let start = self.offset;
        let remaining = self.total_size.saturating_sub(start);
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header_bytes = self.backend.read_at(start, HEADER_SIZE)?;
        let header = RecordHeader::parse(&header_bytes, start)?;
        let len = header.record_len();
        if remaining < len as u64 {
            return Ok(None);
        }

        let record = self.backend.read_at(start, len)?;
        let patch = decode_record(header, &record)?;
        self.offset += len as u64;
        Ok(Some((RecordLocation { offset: start, len }, patch)))
    }
}

impl Iterator for JournalIterator<'_> {
    type Item = CoreResult<(RecordLocation, Patch)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::journal::record::encode_record;
    use mdir_codec::Header;
    use mdir_storage::InMemoryBackend;

    fn log_with(patches: &[Patch]) -> InMemoryBackend {
        let mut log = InMemoryBackend::new();
        for patch in patches {
            log.append(&encode_record(patch).unwrap()).unwrap();
        }
        log
    }

    #[test]
    fn empty_log() {
        let log = InMemoryBackend::new();
        assert_eq!(JournalIterator::new(&log, 0).unwrap().count(), 0);
    }

    #[test]
    fn yields_in_order_with_locations() {
        let patches = vec![
            Patch::add(0, Header::directory("a")),
            Patch::add(1, Header::directory("b")),
        ];
        let log = log_with(&patches);
        let items: Vec<_> = JournalIterator::new(&log, 0)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0.offset, 0);
        assert_eq!(items[1].0.offset, items[0].0.len as u64);
        assert_eq!(items[1].1, patches[1]);
    }

    #[test]
    fn torn_tail_is_clean_end() {
        let log = log_with(&[Patch::add(0, Header::new().with("k", "v"))]);
        let complete = log.len().unwrap();
        let mut bytes = log.data();
        let second = encode_record(&Patch::add(1, Header::new().with("k", "w"))).unwrap();
        bytes.extend_from_slice(&second[..second.len() - 3]);
        let torn = InMemoryBackend::with_data(bytes);

        let mut iter = JournalIterator::new(&torn, 0).unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().is_none());
        assert_eq!(iter.valid_end(), complete);
    }

    #[test]
    fn corruption_is_fatal() {
        let log = log_with(&[Patch::add(0, Header::new().with("k", "v"))]);
        let mut bytes = log.data();
        let last = bytes.len() - 6;
        bytes[last] ^= 0xFF;
        let corrupt = InMemoryBackend::with_data(bytes);

        let mut iter = JournalIterator::new(&corrupt, 0).unwrap();
        assert!(matches!(
            iter.next(),
            Some(Err(CoreError::ChecksumMismatch { .. }))
        ));
        assert!(iter.next().is_none());
    }
}
