//! Folder journal: the durable, append-only patch history of one folder.
//!
//! ## Record Format
//!
//! ```text
//! | magic "MDJL" (4) | format (2) | action (1) | length (4) | payload (N) | crc32 (4) |
//! payload = old_version (i64 LE) | new_version (i64 LE) | CBOR document
//! ```
//!
//! ## Recovery Policy
//!
//! Opening a journal replays every record:
//!
//! - **Truncated tail**: the incomplete record is cut off and the journal
//!   ends at the last complete record. A crash mid-append never acknowledged
//!   that patch.
//! - **Checksum mismatch, bad magic, unknown action**: fatal for this folder.
//! - **Non-contiguous versions**: fatal; a valid journal is gapless.
//!
//! ## Invariants
//!
//! - Records are never modified after write.
//! - Each record's `old_version` equals the previous record's `new_version`.
//! - Readers only see a patch once its bytes are fully in the log.

mod iterator;
mod record;

pub use iterator::{JournalIterator, RecordLocation};
pub use record::{
    compute_crc32, decode_record, encode_record, RecordHeader, CRC_SIZE, HEADER_SIZE,
    JOURNAL_FORMAT, JOURNAL_MAGIC,
};

use crate::config::JournalConfig;
use crate::error::{CoreError, CoreResult};
use mdir_codec::{to_cbor, Header};
use mdir_protocol::{Action, Patch, Version};
use mdir_storage::LogBackend;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    location: RecordLocation,
    old_version: Version,
    action: Action,
}

#[derive(Debug, Default)]
struct JournalIndex {
    /// Keyed by `new_version`: the version each record's document lives at.
    by_version: BTreeMap<Version, IndexEntry>,
    last_version: Version,
}

/// What recovery found when the journal was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Complete records replayed.
    pub records: usize,
    /// Bytes of torn tail that were cut off.
    pub truncated_bytes: u64,
}

/// The append-only patch history of one folder.
///
/// Appends serialize on the log lock; the in-memory index is only updated
/// after a record is completely written, so concurrent readers never see a
/// partial patch.
pub struct Journal {
    backend: Mutex<Box<dyn LogBackend>>,
    index: RwLock<JournalIndex>,
    config: JournalConfig,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("last_version", &self.last_version())
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Opens a journal over `backend`, replaying and validating its records.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a record fails validation or versions
    /// are not contiguous.
    pub fn open(mut backend: Box<dyn LogBackend>, config: JournalConfig) -> CoreResult<Self> {
        let mut index = JournalIndex::default();
        let mut records = 0;

        let valid_end = {
            let mut iter = JournalIterator::new(backend.as_ref(), 0)?;
            for item in iter.by_ref() {
                let (location, patch) = item?;
                if patch.old_version != index.last_version {
                    return Err(CoreError::journal_corruption(format!(
                        "record at offset {} starts at version {}, expected {}",
                        location.offset, patch.old_version, index.last_version
                    )));
                }
                index.by_version.insert(
                    patch.new_version,
                    IndexEntry {
                        location,
                        old_version: patch.old_version,
                        action: patch.action,
                    },
                );
                index.last_version = patch.new_version;
                records += 1;
            }
            iter.valid_end()
        };

        let size = backend.len()?;
        let truncated_bytes = size - valid_end;
        if truncated_bytes > 0 {
            warn!(
                truncated_bytes,
                version = index.last_version,
                "cutting torn journal tail"
            );
            backend.truncate(valid_end)?;
        }

        debug!(records, version = index.last_version, "journal opened");
        Ok(Self {
            backend: Mutex::new(backend),
            index: RwLock::new(index),
            config,
            recovery: RecoveryReport {
                records,
                truncated_bytes,
            },
        })
    }

    /// Opens an empty in-memory journal.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Box::new(mdir_storage::InMemoryBackend::new())),
            index: RwLock::new(JournalIndex::default()),
            config: JournalConfig::default(),
            recovery: RecoveryReport::default(),
        }
    }

    /// What recovery found on open.
    #[must_use]
    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Current version: the `new_version` of the last record, or 0.
    #[must_use]
    pub fn last_version(&self) -> Version {
        self.index.read().last_version
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().by_version.len()
    }

    /// Returns true if nothing was ever appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a one-step patch on top of `expected_old_version`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VersionConflict`] if the journal is not at
    /// `expected_old_version`.
    pub fn append(
        &self,
        action: Action,
        header: Header,
        expected_old_version: Version,
    ) -> CoreResult<Version> {
        let patch = Patch {
            old_version: expected_old_version,
            new_version: expected_old_version + 1,
            action,
            header,
        };
        self.append_patch(&patch)
    }

    /// Appends a patch exactly as given, including any skipped span.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VersionConflict`] if `patch.old_version` is not
    /// the current version, or an error if the document is too large or the
    /// write fails.
    pub fn append_patch(&self, patch: &Patch) -> CoreResult<Version> {
        if patch.new_version <= patch.old_version {
            return Err(CoreError::invalid_argument(format!(
                "patch does not advance: {} -> {}",
                patch.old_version, patch.new_version
            )));
        }
        let document_size = to_cbor(&patch.header)?.len();
        if document_size > self.config.max_document_size {
            return Err(CoreError::DocumentTooLarge {
                size: document_size,
                limit: self.config.max_document_size,
            });
        }

        let mut backend = self.backend.lock();
        let current = self.index.read().last_version;
        if patch.old_version != current {
            return Err(CoreError::VersionConflict {
                expected: patch.old_version,
                actual: current,
            });
        }

        let data = encode_record(patch)?;
        let offset = backend.append(&data)?;
        if self.config.sync_on_append {
            backend.flush()?;
        }

        let mut index = self.index.write();
        index.by_version.insert(
            patch.new_version,
            IndexEntry {
                location: RecordLocation {
                    offset,
                    len: data.len(),
                },
                old_version: patch.old_version,
                action: patch.action,
            },
        );
        index.last_version = patch.new_version;
        debug!(
            old = patch.old_version,
            version = patch.new_version,
            action = %patch.action,
            "journal append"
        );
        Ok(patch.new_version)
    }

    /// Reads the document committed at `version`.
    ///
    /// Returns `None` for versions never written, including versions inside a
    /// skipped span.
    pub fn read(&self, version: Version) -> CoreResult<Option<(Header, Action)>> {
        Ok(self
            .read_patch(version)?
            .map(|patch| (patch.header, patch.action)))
    }

    /// Reads the whole patch whose `new_version` is `version`.
    pub fn read_patch(&self, version: Version) -> CoreResult<Option<Patch>> {
        let entry = self.index.read().by_version.get(&version).copied();
        match entry {
            Some(entry) => self.load(entry).map(Some),
            None => Ok(None),
        }
    }

    /// Reads the first document committed after `after_version`.
    pub fn read_next(&self, after_version: Version) -> CoreResult<Option<(Version, Header, Action)>> {
        let entry = self
            .index
            .read()
            .by_version
            .range((Bound::Excluded(after_version), Bound::Unbounded))
            .next()
            .map(|(version, entry)| (*version, *entry));
        match entry {
            Some((version, entry)) => {
                let patch = self.load(entry)?;
                Ok(Some((version, patch.header, patch.action)))
            }
            None => Ok(None),
        }
    }

    /// Every patch that brings a reader at `from_version` up to date.
    pub fn patches_since(&self, from_version: Version) -> CoreResult<Vec<Patch>> {
        let entries: Vec<IndexEntry> = self
            .index
            .read()
            .by_version
            .range((Bound::Excluded(from_version), Bound::Unbounded))
            .map(|(_, entry)| *entry)
            .filter(|entry| entry.old_version >= from_version)
            .collect();
        entries.into_iter().map(|entry| self.load(entry)).collect()
    }

    /// Flushes the log.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Forces the log to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }

    fn load(&self, entry: IndexEntry) -> CoreResult<Patch> {
        let record = self
            .backend
            .lock()
            .read_at(entry.location.offset, entry.location.len)?;
        let header = RecordHeader::parse(&record, entry.location.offset)?;
        let patch = decode_record(header, &record)?;
        debug_assert_eq!(patch.action, entry.action);
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdir_storage::InMemoryBackend;
    use proptest::prelude::*;

    fn open(log: &InMemoryBackend) -> Journal {
        Journal::open(Box::new(log.clone()), JournalConfig::default()).unwrap()
    }

    #[test]
    fn append_and_read() {
        let journal = Journal::in_memory();
        assert_eq!(journal.last_version(), 0);
        assert!(journal.is_empty());

        let v1 = journal
            .append(Action::Add, Header::directory("inbox"), 0)
            .unwrap();
        let v2 = journal.append(Action::Remove, Header::mark(1), 1).unwrap();
        assert_eq!((v1, v2), (1, 2));

        let (header, action) = journal.read(1).unwrap().unwrap();
        assert_eq!(header.name(), Some("inbox"));
        assert_eq!(action, Action::Add);
        assert!(journal.read(3).unwrap().is_none());
        assert!(journal.read(0).unwrap().is_none());
    }

    #[test]
    fn wrong_expected_version_conflicts() {
        let journal = Journal::in_memory();
        journal.append(Action::Add, Header::new(), 0).unwrap();
        let err = journal.append(Action::Add, Header::new(), 0).unwrap_err();
        assert!(matches!(
            err,
            CoreError::VersionConflict {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(journal.last_version(), 1);
    }

    #[test]
    fn gaps_advance_the_counter() {
        let journal = Journal::in_memory();
        journal.append(Action::Add, Header::new().with("n", "1"), 0).unwrap();
        let gap = Patch::new(1, 5, Action::Add, Header::new().with("n", "5")).unwrap();
        assert_eq!(journal.append_patch(&gap).unwrap(), 5);

        for skipped in 2..5 {
            assert!(journal.read(skipped).unwrap().is_none());
        }
        let (version, header, _) = journal.read_next(1).unwrap().unwrap();
        assert_eq!(version, 5);
        assert_eq!(header.get("n"), Some("5"));
        assert!(journal.read_next(5).unwrap().is_none());
    }

    #[test]
    fn reopen_recovers_state() {
        let log = InMemoryBackend::new();
        {
            let journal = open(&log);
            journal.append(Action::Add, Header::new().with("a", "1"), 0).unwrap();
            journal.append(Action::Add, Header::new().with("a", "2"), 1).unwrap();
        }
        let journal = open(&log);
        assert_eq!(journal.last_version(), 2);
        assert_eq!(journal.recovery().records, 2);
        assert_eq!(journal.read(2).unwrap().unwrap().0.get("a"), Some("2"));
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let log = InMemoryBackend::new();
        open(&log).append(Action::Add, Header::new(), 0).unwrap();
        let complete = log.len().unwrap();

        let mut writer = log.clone();
        let partial = encode_record(&Patch::add(1, Header::new().with("x", "y"))).unwrap();
        writer.append(&partial[..partial.len() / 2]).unwrap();

        let journal = open(&log);
        assert_eq!(journal.last_version(), 1);
        assert!(journal.recovery().truncated_bytes > 0);
        assert_eq!(log.len().unwrap(), complete);

        // appends continue cleanly after the cut
        journal.append(Action::Add, Header::new(), 1).unwrap();
        assert_eq!(open(&log).last_version(), 2);
    }

    #[test]
    fn discontinuous_journal_is_corrupt() {
        let mut log = InMemoryBackend::new();
        log.append(&encode_record(&Patch::add(0, Header::new())).unwrap())
            .unwrap();
        log.append(&encode_record(&Patch::add(3, Header::new())).unwrap())
            .unwrap();
        let err = Journal::open(Box::new(log), JournalConfig::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn oversized_document_refused() {
        let log = InMemoryBackend::new();
        let journal = Journal::open(
            Box::new(log),
            JournalConfig::new().with_max_document_size(16),
        )
        .unwrap();
        let big = Header::new().with("body", "x".repeat(64));
        assert!(matches!(
            journal.append(Action::Add, big, 0),
            Err(CoreError::DocumentTooLarge { .. })
        ));
        assert_eq!(journal.last_version(), 0);
    }

    #[test]
    fn patches_since() {
        let journal = Journal::in_memory();
        for v in 0..4 {
            journal
                .append(Action::Add, Header::new().with("v", v.to_string()), v)
                .unwrap();
        }
        let tail = journal.patches_since(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].old_version, 2);
        assert!(journal.patches_since(4).unwrap().is_empty());
        assert_eq!(journal.patches_since(0).unwrap().len(), 4);
    }

    proptest! {
        #[test]
        fn append_read_roundtrip(
            docs in prop::collection::vec(
                (any::<bool>(), prop::collection::vec(("[a-z]{1,6}", ".*"), 0..4)),
                1..12,
            )
        ) {
            let journal = Journal::in_memory();
            let mut written = Vec::new();
            for (is_add, fields) in docs {
                let action = if is_add { Action::Add } else { Action::Remove };
                let header: Header = fields.into_iter().collect();
                let version = journal
                    .append(action, header.clone(), journal.last_version())
                    .unwrap();
                written.push((version, header, action));
            }
            for (version, header, action) in written {
                prop_assert_eq!(journal.read(version).unwrap(), Some((header, action)));
            }
        }
    }
}
