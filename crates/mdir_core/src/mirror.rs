//! Local mirror layout.
//!
//! ```text
//! <root>/
//! ├─ .tree               # folder tree (owned by the sync engine)
//! ├─ .cache/             # content cache, files named by digest
//! └─ .mdirs/<dirId>/     # one mirror per folder
//!    ├─ .hide/           # materialized documents, named by digest
//!    ├─ .put/            # staged additions, one document per file
//!    ├─ .rem/            # staged removals, file name = target version
//!    ├─ .journal         # durable journal, locked while open
//!    ├─ .version         # last applied version, written atomically
//!    ├─ .syncmap         # name -> digest sync map
//!    └─ <user files>
//! ```
//!
//! Every small metadata file is replaced with write-then-rename so a crash
//! leaves either the old or the new content, never a mix.

use crate::digest::digest_bytes;
use crate::error::{CoreError, CoreResult};
use crate::registry::JOURNAL_FILE_NAME as JOURNAL_FILE;
use crate::types::DirId;
use mdir_codec::{decode_text, encode_text, Header};
use mdir_protocol::Version;
use mdir_storage::FileBackend;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const TREE_FILE: &str = ".tree";
const CACHE_DIR: &str = ".cache";
const MDIRS_DIR: &str = ".mdirs";
const HIDE_DIR: &str = ".hide";
const PUT_DIR: &str = ".put";
const REM_DIR: &str = ".rem";
const VERSION_FILE: &str = ".version";
const SYNC_MAP_FILE: &str = ".syncmap";
const TEMP_SUFFIX: &str = ".tmp";

/// Writes `data` to `path` atomically.
///
/// 1. Write to a temporary sibling
/// 2. Sync it
/// 3. Rename over `path`
/// 4. Sync the directory so the rename is durable
pub fn write_atomic(path: &Path, data: &[u8]) -> CoreResult<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| CoreError::invalid_path(path, "no file name"))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(TEMP_SUFFIX);
    let temp_path = path.with_file_name(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    if let Some(parent) = path.parent() {
        sync_directory(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> CoreResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> CoreResult<()> {
    Ok(())
}

/// Returns true for names reserved by the layout (dot files).
#[must_use]
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with('.')
}

/// The root of a client's local mirror.
#[derive(Debug, Clone)]
pub struct MirrorRoot {
    root: PathBuf,
}

impl MirrorRoot {
    /// Opens or creates the mirror root and its shared directories.
    pub fn open(root: &Path) -> CoreResult<Self> {
        fs::create_dir_all(root.join(CACHE_DIR))?;
        fs::create_dir_all(root.join(MDIRS_DIR))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns true if `root` already holds a mirror.
    #[must_use]
    pub fn exists_at(root: &Path) -> bool {
        root.join(MDIRS_DIR).is_dir()
    }

    /// Root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The folder tree file.
    #[must_use]
    pub fn tree_path(&self) -> PathBuf {
        self.root.join(TREE_FILE)
    }

    /// The shared content cache.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    /// Directory holding one mirror per folder.
    #[must_use]
    pub fn mdirs_dir(&self) -> PathBuf {
        self.root.join(MDIRS_DIR)
    }

    /// The mirror of `dir_id` (not created).
    #[must_use]
    pub fn folder(&self, dir_id: &DirId) -> FolderMirror {
        FolderMirror {
            path: self.mdirs_dir().join(dir_id.as_str()),
        }
    }

    /// Identifiers of every folder mirrored on disk.
    pub fn folder_ids(&self) -> CoreResult<Vec<DirId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.mdirs_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(DirId::new(name));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Moves the mirror of `from` to `to`.
    ///
    /// If `to` already has a mirror, user files and staged changes of `from`
    /// are moved into it (names already taken in `to` get a dotted backup
    /// name instead of being overwritten) and `from` is removed. The journal
    /// and metadata of `from` are dropped; `to` keeps its own.
    pub fn rename_folder(&self, from: &DirId, to: &DirId) -> CoreResult<FolderMirror> {
        let source = self.folder(from);
        let target = self.folder(to);
        if !source.path.exists() {
            target.create()?;
            return Ok(target);
        }
        if !target.path.exists() {
            fs::rename(&source.path, &target.path)?;
            // the journal of a folder the server did not know yet holds nothing durable
            for stale in [JOURNAL_FILE, VERSION_FILE] {
                let path = target.path.join(stale);
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
            info!(%from, %to, "folder mirror renamed");
            return Ok(target);
        }

        target.create()?;
        for name in source.user_files()? {
            let destination = target.path.join(&name);
            let destination = if destination.exists() {
                target.path.join(backup_name(&name))
            } else {
                destination
            };
            fs::rename(source.path.join(&name), destination)?;
        }
        for dir in [PUT_DIR, REM_DIR] {
            for entry in fs::read_dir(source.path.join(dir))? {
                let entry = entry?;
                fs::rename(entry.path(), target.path.join(dir).join(entry.file_name()))?;
            }
        }
        fs::remove_dir_all(&source.path)?;
        info!(%from, %to, "folder mirror merged");
        Ok(target)
    }
}

/// Dotted, timestamped name used to keep a shadowed local file.
///
/// Every call returns a fresh name, so repeated backups of one file within
/// the same second never overwrite each other.
#[must_use]
pub fn backup_name(name: &str) -> String {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let unique = uuid::Uuid::new_v4().simple().to_string();
    format!(".{name}.{stamp}-{}.bak", &unique[..8])
}

/// A document staged for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPut {
    /// Staging file; deleted once the server answers.
    pub path: PathBuf,
    /// The document.
    pub header: Header,
}

/// A removal staged for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRemoval {
    /// Marker file; deleted once the server answers.
    pub path: PathBuf,
    /// Version to remove.
    pub version: Version,
}

/// On-disk mirror of one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderMirror {
    path: PathBuf,
}

impl FolderMirror {
    /// Mirror at an explicit path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates the mirror directories if missing.
    pub fn create(&self) -> CoreResult<()> {
        for dir in [HIDE_DIR, PUT_DIR, REM_DIR] {
            fs::create_dir_all(self.path.join(dir))?;
        }
        Ok(())
    }

    /// Mirror directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the mirror exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Journal file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }

    /// Version file.
    #[must_use]
    pub fn version_path(&self) -> PathBuf {
        self.path.join(VERSION_FILE)
    }

    /// Sync map file.
    #[must_use]
    pub fn sync_map_path(&self) -> PathBuf {
        self.path.join(SYNC_MAP_FILE)
    }

    /// Materialized documents.
    #[must_use]
    pub fn hide_dir(&self) -> PathBuf {
        self.path.join(HIDE_DIR)
    }

    /// Staged additions.
    #[must_use]
    pub fn put_dir(&self) -> PathBuf {
        self.path.join(PUT_DIR)
    }

    /// Staged removals.
    #[must_use]
    pub fn rem_dir(&self) -> PathBuf {
        self.path.join(REM_DIR)
    }

    /// Opens the folder journal log, locking it.
    pub fn open_journal(&self) -> CoreResult<FileBackend> {
        Ok(FileBackend::open_with_create_dirs(&self.journal_path())?)
    }

    /// Last applied version recorded in `.version`.
    ///
    /// Unreadable content is reported and treated as absent.
    pub fn load_version(&self) -> CoreResult<Option<Version>> {
        let text = match fs::read_to_string(self.version_path()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match text.trim().parse() {
            Ok(version) => Ok(Some(version)),
            Err(_) => {
                warn!(path = %self.version_path().display(), "ignoring unreadable version file");
                Ok(None)
            }
        }
    }

    /// Records the last applied version.
    pub fn save_version(&self, version: Version) -> CoreResult<()> {
        write_atomic(&self.version_path(), version.to_string().as_bytes())
    }

    /// Reconciles `.version` with the journal after a restart.
    ///
    /// The journal is authoritative; a differing `.version` is rewritten.
    pub fn recover_version(&self, journal_version: Version) -> CoreResult<Version> {
        let recorded = self.load_version()?;
        if recorded != Some(journal_version) {
            if let Some(recorded) = recorded {
                warn!(
                    recorded,
                    journal = journal_version,
                    path = %self.path.display(),
                    "version file disagrees with journal"
                );
            }
            self.save_version(journal_version)?;
        }
        Ok(journal_version)
    }

    /// Stages a document for upload.
    pub fn stage_put(&self, header: &Header) -> CoreResult<PathBuf> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let path = self.put_dir().join(format!("{nanos:020}-{}", &unique[..8]));
        fs::create_dir_all(self.put_dir())?;
        write_atomic(&path, encode_text(header)?.as_bytes())?;
        debug!(path = %path.display(), "staged put");
        Ok(path)
    }

    /// Staged additions, oldest first.
    pub fn staged_puts(&self) -> CoreResult<Vec<StagedPut>> {
        let mut staged = Vec::new();
        for path in sorted_entries(&self.put_dir())? {
            if is_temp(&path) {
                continue;
            }
            let header = decode_text(&fs::read_to_string(&path)?)?;
            staged.push(StagedPut { path, header });
        }
        Ok(staged)
    }

    /// Stages the removal of the document at `version`.
    pub fn stage_removal(&self, version: Version) -> CoreResult<PathBuf> {
        fs::create_dir_all(self.rem_dir())?;
        let path = self.rem_dir().join(version.to_string());
        File::create(&path)?;
        Ok(path)
    }

    /// Staged removals. Files with a non-numeric name are ignored.
    pub fn staged_removals(&self) -> CoreResult<Vec<StagedRemoval>> {
        let mut staged = Vec::new();
        for path in sorted_entries(&self.rem_dir())? {
            let version = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse().ok());
            if let Some(version) = version {
                staged.push(StagedRemoval { path, version });
            }
        }
        staged.sort_by_key(|removal| removal.version);
        Ok(staged)
    }

    /// Path where `header` is materialized.
    pub fn hidden_path(&self, header: &Header) -> CoreResult<PathBuf> {
        let text = encode_text(header)?;
        Ok(self.hide_dir().join(digest_bytes(text.as_bytes()).as_str()))
    }

    /// Materializes `header` under `.hide`, named by the digest of its text.
    pub fn hide_document(&self, header: &Header) -> CoreResult<PathBuf> {
        let path = self.hidden_path(header)?;
        if !path.exists() {
            fs::create_dir_all(self.hide_dir())?;
            write_atomic(&path, encode_text(header)?.as_bytes())?;
        }
        Ok(path)
    }

    /// Removes the materialized copy of `header`, if any.
    pub fn unhide_document(&self, header: &Header) -> CoreResult<()> {
        let path = self.hidden_path(header)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Path of a user file, refusing names that would escape the mirror or
    /// collide with the layout.
    pub fn user_path(&self, name: &str) -> CoreResult<PathBuf> {
        if name.is_empty()
            || is_reserved_name(name)
            || name.contains(['/', '\\'])
            || name == ".."
        {
            return Err(CoreError::invalid_path(
                self.path.join(name),
                "not a plain file name",
            ));
        }
        Ok(self.path.join(name))
    }

    /// Names of user files (regular files not reserved by the layout).
    pub fn user_files(&self) -> CoreResult<Vec<String>> {
        let mut names = Vec::new();
        if !self.path.exists() {
            return Ok(names);
        }
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) if !is_reserved_name(name) => names.push(name.to_string()),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }
}

fn is_temp(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == &TEMP_SUFFIX[1..])
}

fn sorted_entries(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    match fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    paths.push(entry.path());
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    paths.sort();
    Ok(paths)
}
