//! Test fixtures: temporary mirrors, journals and sample patch chains.

use mdir_codec::Header;
use mdir_core::{
    digest_bytes, DirId, Folder, FolderKind, FolderMirror, Journal, JournalConfig, MirrorRoot,
};
use mdir_protocol::Patch;
use mdir_storage::FileBackend;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A client mirror in a temporary directory.
pub struct TempMirror {
    /// The mirror.
    pub root: MirrorRoot,
    _temp_dir: TempDir,
}

impl TempMirror {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = MirrorRoot::open(temp_dir.path()).expect("Failed to open mirror");
        Self {
            root,
            _temp_dir: temp_dir,
        }
    }

    /// Mirror root directory.
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// The mirror of `dir_id`, created on demand.
    pub fn folder(&self, dir_id: &str) -> FolderMirror {
        let folder = self.root.folder(&DirId::new(dir_id));
        folder.create().expect("Failed to create folder mirror");
        folder
    }

    /// Writes a user file into the mirror of `dir_id`.
    pub fn write_file(&self, dir_id: &str, name: &str, body: &[u8]) -> PathBuf {
        let path = self.folder(dir_id).path().join(name);
        std::fs::write(&path, body).expect("Failed to write file");
        path
    }
}

impl Default for TempMirror {
    fn default() -> Self {
        Self::new()
    }
}

/// A journal file in a temporary directory.
pub struct TempJournal {
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TempJournal {
    /// Creates a location for a journal; nothing is written yet.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        Self {
            path: temp_dir.path().join("folder").join(mdir_core::JOURNAL_FILE_NAME),
            _temp_dir: temp_dir,
        }
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens (recovering) the journal. Only one handle may be open at a time.
    pub fn open(&self) -> Journal {
        let backend =
            FileBackend::open_with_create_dirs(&self.path).expect("Failed to open journal file");
        Journal::open(Box::new(backend), JournalConfig::default()).expect("Failed to open journal")
    }
}

impl Default for TempJournal {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test with a temporary mirror.
pub fn with_temp_mirror<F, R>(f: F) -> R
where
    F: FnOnce(&TempMirror) -> R,
{
    let mirror = TempMirror::new();
    f(&mirror)
}

/// A contiguous chain of `len` one-step mail patches starting at version 0.
pub fn sample_chain(len: usize) -> Vec<Patch> {
    (0..len as i64)
        .map(|version| {
            Patch::add(
                version,
                Header::new().with("subject", format!("message {version}")),
            )
        })
        .collect()
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// An in-memory folder holding one file document per name, with the
    /// body equal to the name.
    pub fn folder_with_files(names: &[&str]) -> Folder {
        let folder = Folder::in_memory(DirId::new("files"), FolderKind::Plain);
        for name in names {
            let digest = digest_bytes(name.as_bytes());
            folder
                .add(Header::file(*name, digest.as_str(), digest.as_str()))
                .expect("Failed to add file document");
        }
        folder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_mirror() {
        with_temp_mirror(|mirror| {
            let path = mirror.write_file("7", "a.txt", b"hello");
            assert!(path.is_file());
            assert_eq!(mirror.folder("7").user_files().unwrap(), vec!["a.txt"]);
        });
    }

    #[test]
    fn test_temp_journal() {
        let journal = TempJournal::new();
        {
            let open = journal.open();
            for patch in sample_chain(3) {
                open.append_patch(&patch).unwrap();
            }
        }
        assert_eq!(journal.open().last_version(), 3);
    }

    #[test]
    fn test_files_scenario() {
        let folder = scenarios::folder_with_files(&["a.txt", "b.txt"]);
        assert_eq!(folder.files().len(), 2);
        assert_eq!(folder.version(), 2);
    }
}
