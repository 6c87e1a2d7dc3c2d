//! CLI command implementations.

pub mod dump_journal;
pub mod inspect;
pub mod plan;
pub mod serve;
pub mod verify;

use mdir_core::journal::{JournalIterator, RecordLocation};
use mdir_core::{CoreError, DirId, MirrorRoot, JOURNAL_FILE_NAME};
use mdir_protocol::Patch;
use mdir_sync_engine::FolderTree;
use mdir_storage::{FileBackend, LogBackend};
use std::path::{Path, PathBuf};

/// Everything readable in one journal file.
#[derive(Debug)]
pub struct JournalScan {
    /// Journal file.
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Complete, valid records in order.
    pub records: Vec<(RecordLocation, Patch)>,
    /// Where the valid prefix ends.
    pub valid_end: u64,
    /// The error that stopped the scan, if any.
    pub error: Option<CoreError>,
}

impl JournalScan {
    /// Version after the last valid record.
    pub fn last_version(&self) -> i64 {
        self.records.last().map_or(0, |(_, patch)| patch.new_version)
    }

    /// Bytes after the valid prefix that a crash left behind.
    pub fn torn_bytes(&self) -> u64 {
        if self.error.is_some() {
            0
        } else {
            self.size - self.valid_end
        }
    }
}

/// Accepts either a journal file or a folder directory holding one.
pub fn journal_file(path: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let file = if path.is_dir() {
        path.join(JOURNAL_FILE_NAME)
    } else {
        path.to_path_buf()
    };
    if !file.is_file() {
        return Err(format!("no journal at {}", file.display()).into());
    }
    Ok(file)
}

/// Reads a journal without repairing it.
pub fn scan_journal(path: &Path) -> Result<JournalScan, Box<dyn std::error::Error>> {
    let file = journal_file(path)?;
    let backend = FileBackend::open(&file)?;
    let size = backend.len()?;
    let mut iter = JournalIterator::new(&backend, 0)?;
    let mut records = Vec::new();
    let mut error = None;
    for item in iter.by_ref() {
        match item {
            Ok(record) => records.push(record),
            Err(e) => error = Some(e),
        }
    }
    Ok(JournalScan {
        path: file,
        size,
        records,
        valid_end: iter.valid_end(),
        error,
    })
}

/// Opens an existing client mirror and its folder tree.
pub fn open_mirror(
    path: &Path,
    root_dir_id: &str,
) -> Result<(MirrorRoot, FolderTree), Box<dyn std::error::Error>> {
    if !MirrorRoot::exists_at(path) {
        return Err(format!("no mirror at {}", path.display()).into());
    }
    let mirror = MirrorRoot::open(path)?;
    let tree = FolderTree::load(&mirror.tree_path(), DirId::new(root_dir_id))?;
    Ok((mirror, tree))
}

#[cfg(test)]
pub(crate) mod test_support {
    use mdir_codec::Header;
    use mdir_core::journal::encode_record;
    use mdir_protocol::Patch;
    use mdir_storage::{FileBackend, LogBackend};
    use std::path::Path;

    /// Writes `patches` as a journal at `path`.
    pub fn write_journal(path: &Path, patches: &[Patch]) {
        let mut log = FileBackend::open_with_create_dirs(path).unwrap();
        for patch in patches {
            log.append(&encode_record(patch).unwrap()).unwrap();
        }
        log.sync().unwrap();
    }

    pub fn sample() -> Vec<Patch> {
        vec![
            Patch::add(0, Header::directory("docs").with("dirId", "7")),
            Patch::add(1, Header::file("a.txt", "ab", "ab")),
            Patch::remove(2, 1),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{sample, write_journal};
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn scans_folder_directory() {
        let dir = tempdir().unwrap();
        write_journal(&dir.path().join(JOURNAL_FILE_NAME), &sample());
        let scan = scan_journal(dir.path()).unwrap();
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.last_version(), 3);
        assert_eq!(scan.torn_bytes(), 0);
        assert!(scan.error.is_none());
    }

    #[test]
    fn reports_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.journal");
        write_journal(&path, &sample());
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"MDJL\x01")
            .unwrap();
        let scan = scan_journal(&path).unwrap();
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.torn_bytes(), 5);
    }

    #[test]
    fn missing_journal() {
        let dir = tempdir().unwrap();
        assert!(scan_journal(dir.path()).is_err());
    }
}
