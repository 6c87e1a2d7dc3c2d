//! Folder tree and transient identifier resolution.
//!
//! The tree maps slash-separated paths (`""` is the top folder) to folder
//! identifiers. A folder created before the server acknowledged it is linked
//! under a transient identifier so it can be used offline; the link is
//! rewritten once the durable identifier is known.
//!
//! The tree is persisted as JSON in the mirror's `.tree` file.

use crate::error::{SyncError, SyncResult};
use mdir_codec::Header;
use mdir_core::{write_atomic, CoreError, CoreResult, DirId, FolderKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A folder created locally and not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCreation {
    /// Tree path of the folder.
    pub path: String,
    /// Name of the staged PUT in the parent's mirror, once staged.
    pub staged: Option<String>,
    /// The creation was rejected; look the name up in the parent instead.
    pub needs_resolve: bool,
    /// Kind requested for the folder, kept for re-staging.
    #[serde(default)]
    pub kind: FolderKind,
}

/// What [`FolderTree::discover`] did with a remote directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// A new link was created.
    Linked,
    /// The path already pointed at this folder.
    Known,
    /// The path pointed at a local transient folder of the same name; the
    /// caller should confirm it as this folder.
    Merge(DirId),
    /// The path already points at a different durable folder; left alone.
    Shadowed(DirId),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TreeState {
    links: BTreeMap<String, DirId>,
    pending: BTreeMap<DirId, PendingCreation>,
}

/// Path to folder identifier mapping.
#[derive(Debug)]
pub struct FolderTree {
    file: Option<PathBuf>,
    root: DirId,
    state: TreeState,
}

impl FolderTree {
    /// A tree that is never persisted.
    #[must_use]
    pub fn in_memory(root: DirId) -> Self {
        Self {
            file: None,
            root,
            state: TreeState::default(),
        }
    }

    /// Loads the tree from `file`, starting empty if it does not exist.
    pub fn load(file: &Path, root: DirId) -> SyncResult<Self> {
        let state = match std::fs::read(file) {
            Ok(data) if data.is_empty() => TreeState::default(),
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TreeState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            file: Some(file.to_path_buf()),
            root,
            state,
        })
    }

    /// Persists the tree.
    pub fn save(&self) -> SyncResult<()> {
        if let Some(file) = &self.file {
            let data = serde_json::to_vec_pretty(&self.state)?;
            write_atomic(file, &data)?;
        }
        Ok(())
    }

    /// Identifier of the top folder.
    #[must_use]
    pub fn root_id(&self) -> &DirId {
        &self.root
    }

    /// Normalizes a tree path: no leading or trailing slash, no empty or
    /// dotted components.
    pub fn normalize(path: &str) -> SyncResult<String> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(String::new());
        }
        for component in trimmed.split('/') {
            if component.is_empty() || component.starts_with('.') || component.contains('\\') {
                return Err(SyncError::invalid_path(path, "bad path component"));
            }
        }
        Ok(trimmed.to_string())
    }

    /// Splits a normalized path into parent path and final name.
    #[must_use]
    pub fn split(path: &str) -> Option<(&str, &str)> {
        match path.rsplit_once('/') {
            Some((parent, name)) => Some((parent, name)),
            None if path.is_empty() => None,
            None => Some(("", path)),
        }
    }

    /// Joins a parent path and a name.
    #[must_use]
    pub fn join(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }

    /// Identifier linked at `path`.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<DirId> {
        if path.is_empty() {
            return Some(self.root.clone());
        }
        self.state.links.get(path).cloned()
    }

    /// Path linking `dir_id`, if any.
    #[must_use]
    pub fn path_of(&self, dir_id: &DirId) -> Option<String> {
        if *dir_id == self.root {
            return Some(String::new());
        }
        self.state
            .links
            .iter()
            .find(|(_, id)| *id == dir_id)
            .map(|(path, _)| path.clone())
    }

    /// Every folder in the tree, top folder first.
    #[must_use]
    pub fn folders(&self) -> Vec<(String, DirId)> {
        std::iter::once((String::new(), self.root.clone()))
            .chain(
                self.state
                    .links
                    .iter()
                    .map(|(path, id)| (path.clone(), id.clone())),
            )
            .collect()
    }

    /// Links `path` to `dir_id`, returning the identifier it replaced.
    ///
    /// # Errors
    ///
    /// The parent must be linked, and a transient identifier may only be
    /// linked from one path.
    pub fn link(&mut self, path: &str, dir_id: DirId) -> SyncResult<Option<DirId>> {
        let path = Self::normalize(path)?;
        let (parent, _) =
            Self::split(&path).ok_or_else(|| SyncError::invalid_path(&path, "cannot relink the top folder"))?;
        if self.resolve(parent).is_none() {
            return Err(SyncError::UnknownFolder {
                path: parent.to_string(),
            });
        }
        if dir_id.is_transient() {
            if let Some(existing) = self.path_of(&dir_id).filter(|existing| *existing != path) {
                return Err(SyncError::DiamondLink {
                    dir_id: dir_id.to_string(),
                    existing,
                });
            }
        }
        debug!(path = %path, %dir_id, "folder linked");
        Ok(self.state.links.insert(path, dir_id))
    }

    /// Removes the link at `path` and every link below it.
    pub fn unlink(&mut self, path: &str) -> Option<DirId> {
        let prefix = format!("{path}/");
        let below: Vec<String> = self
            .state
            .links
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in below {
            if let Some(id) = self.state.links.remove(&p) {
                self.state.pending.remove(&id);
            }
        }
        let removed = self.state.links.remove(path)?;
        self.state.pending.remove(&removed);
        Some(removed)
    }

    /// Links `path` to a fresh transient identifier and records the pending
    /// creation. An existing link at `path` is returned unchanged.
    pub fn create_transient(&mut self, path: &str, kind: FolderKind) -> SyncResult<DirId> {
        let path = Self::normalize(path)?;
        if let Some(existing) = self.resolve(&path) {
            return Ok(existing);
        }
        let dir_id = DirId::transient();
        self.link(&path, dir_id.clone())?;
        self.state.pending.insert(
            dir_id.clone(),
            PendingCreation {
                path,
                staged: None,
                needs_resolve: false,
                kind,
            },
        );
        Ok(dir_id)
    }

    /// Pending creations.
    pub fn pending(&self) -> impl Iterator<Item = (&DirId, &PendingCreation)> {
        self.state.pending.iter()
    }

    /// Records the staged PUT carrying the creation of `transient`.
    pub fn set_staged(&mut self, transient: &DirId, staged: impl Into<String>) {
        if let Some(pending) = self.state.pending.get_mut(transient) {
            pending.staged = Some(staged.into());
            pending.needs_resolve = false;
        }
    }

    /// The pending creation whose PUT is the staged file `staged`.
    #[must_use]
    pub fn pending_by_staged(&self, staged: &str) -> Option<DirId> {
        self.state
            .pending
            .iter()
            .find(|(_, pending)| pending.staged.as_deref() == Some(staged))
            .map(|(id, _)| id.clone())
    }

    /// Marks a creation as rejected; it will be re-resolved by name.
    pub fn mark_unresolved(&mut self, transient: &DirId) {
        if let Some(pending) = self.state.pending.get_mut(transient) {
            pending.staged = None;
            pending.needs_resolve = true;
        }
    }

    /// Replaces `transient` with `durable` wherever it is linked.
    ///
    /// Returns the path that was rewritten, or `None` if the transient
    /// folder was no longer linked.
    pub fn confirm(&mut self, transient: &DirId, durable: &DirId) -> SyncResult<Option<String>> {
        self.guard_dir_id(durable)?;
        self.state.pending.remove(transient);
        let Some(path) = self.path_of(transient) else {
            warn!(%transient, %durable, "confirmed folder is no longer linked");
            return Ok(None);
        };
        self.state.links.insert(path.clone(), durable.clone());
        info!(path = %path, %transient, %durable, "folder confirmed");
        Ok(Some(path))
    }

    /// Folds a directory entry seen in the journal of the folder at
    /// `parent` into the tree.
    pub fn discover(&mut self, parent: &str, name: &str, dir_id: &DirId) -> SyncResult<Discovery> {
        if dir_id.is_transient() {
            return Err(CoreError::TransientIdLeak(dir_id.clone()).into());
        }
        let path = Self::join(parent, name);
        match self.resolve(&path) {
            None => {
                self.link(&path, dir_id.clone())?;
                Ok(Discovery::Linked)
            }
            Some(existing) if existing == *dir_id => Ok(Discovery::Known),
            Some(existing) if existing.is_transient() => Ok(Discovery::Merge(existing)),
            Some(existing) => {
                warn!(path = %path, %existing, remote = %dir_id, "two folders share a name");
                Ok(Discovery::Shadowed(existing))
            }
        }
    }

    /// Refuses a transient identifier about to be sent to the server.
    pub fn guard_dir_id(&self, dir_id: &DirId) -> CoreResult<()> {
        if dir_id.is_transient() {
            return Err(CoreError::TransientIdLeak(dir_id.clone()));
        }
        Ok(())
    }

    /// Refuses a document embedding a transient identifier.
    pub fn guard_header(&self, header: &Header) -> CoreResult<()> {
        match header.dir_id() {
            Some(id) => self.guard_dir_id(&DirId::new(id)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tree() -> FolderTree {
        let mut tree = FolderTree::in_memory(DirId::new("root"));
        tree.link("P", DirId::new("5")).unwrap();
        tree
    }

    #[test]
    fn normalize_paths() {
        assert_eq!(FolderTree::normalize("/P/q/").unwrap(), "P/q");
        assert_eq!(FolderTree::normalize("").unwrap(), "");
        assert!(FolderTree::normalize("P//q").is_err());
        assert!(FolderTree::normalize("P/../q").is_err());
        assert!(FolderTree::normalize(".mdirs").is_err());
    }

    #[test]
    fn resolve_and_reverse() {
        let tree = tree();
        assert_eq!(tree.resolve(""), Some(DirId::new("root")));
        assert_eq!(tree.resolve("P"), Some(DirId::new("5")));
        assert_eq!(tree.path_of(&DirId::new("5")).as_deref(), Some("P"));
        assert_eq!(tree.resolve("Q"), None);
    }

    #[test]
    fn offline_creation_then_confirmation() {
        let mut tree = tree();
        let transient = tree.create_transient("P/newsub", FolderKind::Plain).unwrap();
        assert!(transient.is_transient());
        assert_eq!(tree.resolve("P/newsub"), Some(transient.clone()));
        assert_eq!(tree.create_transient("P/newsub", FolderKind::Plain).unwrap(), transient);

        tree.set_staged(&transient, "0001-abc");
        assert_eq!(tree.pending_by_staged("0001-abc"), Some(transient.clone()));

        let path = tree.confirm(&transient, &DirId::new("42")).unwrap();
        assert_eq!(path.as_deref(), Some("P/newsub"));
        assert_eq!(tree.resolve("P/newsub"), Some(DirId::new("42")));
        assert_eq!(tree.pending().count(), 0);
    }

    #[test]
    fn creation_needs_parent() {
        let mut tree = tree();
        assert!(matches!(
            tree.create_transient("missing/child", FolderKind::Plain),
            Err(SyncError::UnknownFolder { .. })
        ));
    }

    #[test]
    fn transient_cannot_be_linked_twice() {
        let mut tree = tree();
        let transient = tree.create_transient("P/a", FolderKind::Plain).unwrap();
        assert!(matches!(
            tree.link("P/b", transient.clone()),
            Err(SyncError::DiamondLink { .. })
        ));
        // durable identifiers may appear twice
        tree.link("P/c", DirId::new("9")).unwrap();
        tree.link("P/d", DirId::new("9")).unwrap();
    }

    #[test]
    fn transient_never_leaves() {
        let tree = tree();
        let leaking = Header::directory("x").with("dirId", "_abc");
        assert!(matches!(
            tree.guard_header(&leaking),
            Err(CoreError::TransientIdLeak(_))
        ));
        assert!(tree.guard_header(&Header::directory("x")).is_ok());
        assert!(tree.guard_dir_id(&DirId::new("_abc")).is_err());
    }

    #[test]
    fn discovery_merges_same_name() {
        let mut tree = tree();
        let transient = tree.create_transient("P/shared", FolderKind::Plain).unwrap();

        assert_eq!(
            tree.discover("P", "shared", &DirId::new("7")).unwrap(),
            Discovery::Merge(transient.clone())
        );
        tree.confirm(&transient, &DirId::new("7")).unwrap();
        assert_eq!(
            tree.discover("P", "shared", &DirId::new("7")).unwrap(),
            Discovery::Known
        );
        assert_eq!(
            tree.discover("P", "other", &DirId::new("8")).unwrap(),
            Discovery::Linked
        );
        assert_eq!(
            tree.discover("P", "other", &DirId::new("10")).unwrap(),
            Discovery::Shadowed(DirId::new("8"))
        );
    }

    #[test]
    fn unlink_removes_subtree() {
        let mut tree = tree();
        tree.link("P/a", DirId::new("6")).unwrap();
        tree.create_transient("P/a/b", FolderKind::Plain).unwrap();
        assert_eq!(tree.unlink("P"), Some(DirId::new("5")));
        assert_eq!(tree.folders().len(), 1);
        assert_eq!(tree.pending().count(), 0);
    }

    #[test]
    fn persisted() {
        let dir = tempdir().unwrap();
        let file = dir.path().join(".tree");
        let transient = {
            let mut tree = FolderTree::load(&file, DirId::new("root")).unwrap();
            tree.link("P", DirId::new("5")).unwrap();
            let transient = tree.create_transient("P/new", FolderKind::Plain).unwrap();
            tree.save().unwrap();
            transient
        };
        let tree = FolderTree::load(&file, DirId::new("root")).unwrap();
        assert_eq!(tree.resolve("P/new"), Some(transient.clone()));
        assert_eq!(tree.pending().next().unwrap().0, &transient);
    }
}
