//! Folder registry: the one in-memory object per folder identifier.
//!
//! The registry is an explicit context object rather than a process-wide
//! table, so several independent clients or servers can live in one process.
//! Folders are opened on first lookup and cached. With a bounded capacity the
//! least recently used *idle* folder (no handle held outside the registry) is
//! evicted; it reopens from storage on the next lookup.

use crate::config::JournalConfig;
use crate::error::CoreResult;
use crate::folder::{Folder, FolderKind};
use crate::types::DirId;
use mdir_storage::{FileBackend, InMemoryBackend, LogBackend};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// File name of a folder journal inside its directory.
pub const JOURNAL_FILE_NAME: &str = ".journal";

/// Where folder journals live.
pub trait FolderStorage: Send + Sync {
    /// Opens (creating if needed) the log backing `dir_id`.
    fn open_log(&self, dir_id: &DirId) -> CoreResult<Box<dyn LogBackend>>;

    /// Identifiers of every folder that has a log.
    fn existing_ids(&self) -> CoreResult<Vec<DirId>>;
}

/// Journals kept in memory. Logs survive eviction for the lifetime of the
/// storage object.
#[derive(Debug, Default)]
pub struct MemoryFolderStorage {
    logs: Mutex<HashMap<DirId, InMemoryBackend>>,
}

impl MemoryFolderStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FolderStorage for MemoryFolderStorage {
    fn open_log(&self, dir_id: &DirId) -> CoreResult<Box<dyn LogBackend>> {
        let mut logs = self.logs.lock();
        let log = logs.entry(dir_id.clone()).or_default();
        Ok(Box::new(log.clone()))
    }

    fn existing_ids(&self) -> CoreResult<Vec<DirId>> {
        let mut ids: Vec<_> = self.logs.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Journals stored as `<root>/<dirId>/.journal`.
///
/// This is also the layout of the client mirror's `.mdirs` directory.
#[derive(Debug, Clone)]
pub struct DirectoryFolderStorage {
    root: PathBuf,
}

impl DirectoryFolderStorage {
    /// Storage rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Journal path of `dir_id`.
    #[must_use]
    pub fn journal_path(&self, dir_id: &DirId) -> PathBuf {
        self.root.join(dir_id.as_str()).join(JOURNAL_FILE_NAME)
    }
}

impl FolderStorage for DirectoryFolderStorage {
    fn open_log(&self, dir_id: &DirId) -> CoreResult<Box<dyn LogBackend>> {
        let backend = FileBackend::open_with_create_dirs(&self.journal_path(dir_id))?;
        Ok(Box::new(backend))
    }

    fn existing_ids(&self) -> CoreResult<Vec<DirId>> {
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.path().join(JOURNAL_FILE_NAME).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(DirId::new(name));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

struct CachedFolder {
    folder: Arc<Folder>,
    last_used: AtomicU64,
}

/// Cache of open folders.
pub struct FolderRegistry {
    storage: Arc<dyn FolderStorage>,
    config: JournalConfig,
    capacity: usize,
    folders: RwLock<HashMap<DirId, CachedFolder>>,
    kinds: RwLock<HashMap<DirId, FolderKind>>,
    clock: AtomicU64,
    next_id: AtomicU64,
}

impl std::fmt::Debug for FolderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderRegistry")
            .field("capacity", &self.capacity)
            .field("open", &self.len())
            .finish()
    }
}

impl FolderRegistry {
    /// Creates a registry over `storage` with no capacity bound.
    pub fn new(storage: Arc<dyn FolderStorage>, config: JournalConfig) -> CoreResult<Self> {
        Self::with_capacity(storage, config, usize::MAX)
    }

    /// Creates a registry keeping at most `capacity` idle folders open.
    ///
    /// Durable identifiers handed out by [`allocate_dir_id`] continue after
    /// the largest numeric identifier already in storage.
    ///
    /// [`allocate_dir_id`]: FolderRegistry::allocate_dir_id
    pub fn with_capacity(
        storage: Arc<dyn FolderStorage>,
        config: JournalConfig,
        capacity: usize,
    ) -> CoreResult<Self> {
        let highest = storage
            .existing_ids()?
            .iter()
            .filter_map(|id| id.as_str().parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(Self {
            storage,
            config,
            capacity: capacity.max(1),
            folders: RwLock::new(HashMap::new()),
            kinds: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            next_id: AtomicU64::new(highest + 1),
        })
    }

    /// An in-memory registry.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            storage: Arc::new(MemoryFolderStorage::new()),
            config: JournalConfig::default(),
            capacity: usize::MAX,
            folders: RwLock::new(HashMap::new()),
            kinds: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Records the kind `dir_id` is opened with from now on.
    pub fn set_kind(&self, dir_id: &DirId, kind: FolderKind) {
        self.kinds.write().insert(dir_id.clone(), kind);
    }

    /// The folder for `dir_id`, opening it with its recorded kind.
    pub fn get_or_open(&self, dir_id: &DirId) -> CoreResult<Arc<Folder>> {
        let kind = self.kinds.read().get(dir_id).copied().unwrap_or_default();
        self.get_or_open_with_kind(dir_id, kind)
    }

    /// The folder for `dir_id`. `kind` is only used if the folder is not open.
    pub fn get_or_open_with_kind(&self, dir_id: &DirId, kind: FolderKind) -> CoreResult<Arc<Folder>> {
        if let Some(folder) = self.lookup(dir_id) {
            return Ok(folder);
        }

        let mut folders = self.folders.write();
        if let Some(cached) = folders.get(dir_id) {
            cached.last_used.store(self.tick(), Ordering::Relaxed);
            return Ok(Arc::clone(&cached.folder));
        }

        let log = self.storage.open_log(dir_id)?;
        let folder = Arc::new(Folder::open(dir_id.clone(), kind, log, self.config.clone())?);
        folders.insert(
            dir_id.clone(),
            CachedFolder {
                folder: Arc::clone(&folder),
                last_used: AtomicU64::new(self.tick()),
            },
        );
        if folders.len() > self.capacity {
            Self::evict_lru(&mut folders, self.capacity);
        }
        Ok(folder)
    }

    /// The folder for `dir_id` if it is open.
    #[must_use]
    pub fn lookup(&self, dir_id: &DirId) -> Option<Arc<Folder>> {
        let folders = self.folders.read();
        let cached = folders.get(dir_id)?;
        cached.last_used.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(&cached.folder))
    }

    /// Drops the registry's handle on `dir_id`, releasing its journal once
    /// every other handle is gone.
    pub fn forget(&self, dir_id: &DirId) -> Option<Arc<Folder>> {
        self.folders.write().remove(dir_id).map(|cached| cached.folder)
    }

    /// Allocates a fresh durable identifier.
    pub fn allocate_dir_id(&self) -> DirId {
        DirId::new(self.next_id.fetch_add(1, Ordering::Relaxed).to_string())
    }

    /// Closes every idle folder. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let mut folders = self.folders.write();
        let before = folders.len();
        folders.retain(|_, cached| Arc::strong_count(&cached.folder) > 1);
        before - folders.len()
    }

    /// Number of open folders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.folders.read().len()
    }

    /// Returns true if no folder is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.folders.read().is_empty()
    }

    /// Identifiers of every folder in storage, open or not.
    pub fn known_ids(&self) -> CoreResult<Vec<DirId>> {
        let mut ids = self.storage.existing_ids()?;
        for id in self.folders.read().keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_lru(folders: &mut HashMap<DirId, CachedFolder>, capacity: usize) {
        while folders.len() > capacity {
            let victim = folders
                .iter()
                .filter(|(_, cached)| Arc::strong_count(&cached.folder) == 1)
                .min_by_key(|(_, cached)| cached.last_used.load(Ordering::Relaxed))
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    folders.remove(&id);
                    debug!(dir_id = %id, "folder evicted");
                }
                // everything is in use; stay over capacity until handles drop
                None => break,
            }
        }
    }
}
