//! Content store collaborator.
//!
//! File bodies never travel inside patches; a file document only carries a
//! digest and a resource reference. The content store turns one into the
//! other.

use crate::error::{SyncError, SyncResult};
use mdir_core::{digest_file, Digest};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where file bodies live.
pub trait ContentStore: Send + Sync {
    /// Makes the body behind `resource` available locally and returns its
    /// path.
    fn fetch(&self, resource: &str) -> SyncResult<PathBuf>;

    /// Stores the body at `path` and returns a reference to it.
    fn upload(&self, path: &Path) -> SyncResult<String>;
}

/// A directory of bodies named by digest. The resource reference is the
/// digest itself, so uploading identical content twice stores it once.
#[derive(Debug, Clone)]
pub struct LocalContentStore {
    dir: PathBuf,
}

impl LocalContentStore {
    /// Opens (creating) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn body_path(&self, resource: &str) -> SyncResult<PathBuf> {
        let valid = !resource.is_empty() && resource.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(SyncError::Content(format!("bad resource reference {resource:?}")));
        }
        Ok(self.dir.join(resource))
    }
}

impl ContentStore for LocalContentStore {
    fn fetch(&self, resource: &str) -> SyncResult<PathBuf> {
        let path = self.body_path(resource)?;
        if !path.is_file() {
            return Err(SyncError::Content(format!("unknown resource {resource}")));
        }
        Ok(path)
    }

    fn upload(&self, path: &Path) -> SyncResult<String> {
        let digest: Digest = digest_file(path)?;
        let target = self.body_path(digest.as_str())?;
        if !target.exists() {
            let mut temp = target.clone().into_os_string();
            temp.push(".part");
            fs::copy(path, &temp)?;
            fs::rename(&temp, &target)?;
            debug!(%digest, "body uploaded");
        }
        Ok(digest.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdir_core::digest_bytes;
    use tempfile::tempdir;

    #[test]
    fn upload_then_fetch() {
        let dir = tempdir().unwrap();
        let store = LocalContentStore::open(dir.path().join("store")).unwrap();
        let source = dir.path().join("a.txt");
        fs::write(&source, b"hello").unwrap();

        let resource = store.upload(&source).unwrap();
        assert_eq!(resource, digest_bytes(b"hello").as_str());
        assert_eq!(fs::read(store.fetch(&resource).unwrap()).unwrap(), b"hello");

        // same content, same reference
        let copy = dir.path().join("b.txt");
        fs::write(&copy, b"hello").unwrap();
        assert_eq!(store.upload(&copy).unwrap(), resource);
    }

    #[test]
    fn bad_references() {
        let dir = tempdir().unwrap();
        let store = LocalContentStore::open(dir.path()).unwrap();
        assert!(store.fetch("../etc/passwd").is_err());
        assert!(store.fetch("abcd").is_err());
    }
}
