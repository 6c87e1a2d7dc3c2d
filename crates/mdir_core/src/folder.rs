//! A folder ("mdir"): journal, reassembly buffer and materialized view.

use crate::config::JournalConfig;
use crate::error::{CoreError, CoreResult};
use crate::journal::Journal;
use crate::reassembly::{OfferOutcome, ReassemblyBuffer};
use crate::types::DirId;
use crate::view::{DirectoryRecord, FileRecord, MaterializedView, ViewEntry};
use mdir_codec::{DocType, Header};
use mdir_protocol::{Action, Patch, Version};
use mdir_storage::LogBackend;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// Field of a directory document selecting the kind of the folder it links.
pub const FIELD_KIND: &str = "kind";

/// What a folder is used for.
///
/// Chosen once when the folder is opened. It only decides which document
/// types the folder exposes as entries; every document is still journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderKind {
    /// Directories and files.
    #[default]
    Plain,
    /// Directories, files and mail.
    Mail,
    /// Directories, files and distribution rules.
    Rules,
}

impl FolderKind {
    /// Value used in the `kind` field of directory documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FolderKind::Plain => "plain",
            FolderKind::Mail => "mail",
            FolderKind::Rules => "rules",
        }
    }

    /// Parses a `kind` field; unknown values fall back to plain.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "mail" => FolderKind::Mail,
            "rules" => FolderKind::Rules,
            _ => FolderKind::Plain,
        }
    }

    /// The kind a directory document asks for.
    #[must_use]
    pub fn of_directory(header: &Header) -> Self {
        header.get(FIELD_KIND).map(Self::parse).unwrap_or_default()
    }

    /// Directory document linking a sub-folder `name` of this kind.
    #[must_use]
    pub fn directory(self, name: impl Into<String>) -> Header {
        let header = Header::directory(name);
        if self == FolderKind::Plain {
            header
        } else {
            header.with(FIELD_KIND, self.as_str())
        }
    }

    /// Returns true if entries of `doc_type` are exposed by this kind.
    #[must_use]
    pub fn exposes(self, doc_type: DocType) -> bool {
        match doc_type {
            DocType::Directory | DocType::File => true,
            DocType::Mail => self == FolderKind::Mail,
            DocType::DistributionRule => self == FolderKind::Rules,
            DocType::Mark | DocType::Permission => false,
        }
    }
}

impl fmt::Display for FolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of offering a remote patch to a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// What the reassembly buffer did with the offered patch.
    pub outcome: OfferOutcome,
    /// Patches committed to the journal as a result, in order.
    pub applied: Vec<Patch>,
    /// Patches still waiting for a gap to close.
    pub pending: usize,
}

struct FolderState {
    buffer: ReassemblyBuffer,
    view: MaterializedView,
}

/// One folder.
///
/// All mutation goes through the folder lock, so patches for one folder are
/// applied strictly in version order and never concurrently.
pub struct Folder {
    dir_id: DirId,
    kind: FolderKind,
    journal: Journal,
    state: Mutex<FolderState>,
}

impl fmt::Debug for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Folder")
            .field("dir_id", &self.dir_id)
            .field("kind", &self.kind)
            .field("version", &self.version())
            .finish()
    }
}

impl Folder {
    /// Opens a folder over a log, replaying its journal into the view.
    ///
    /// # Errors
    ///
    /// Fails if the journal is corrupt.
    pub fn open(
        dir_id: DirId,
        kind: FolderKind,
        backend: Box<dyn LogBackend>,
        config: JournalConfig,
    ) -> CoreResult<Self> {
        let journal = Journal::open(backend, config)?;
        let mut view = MaterializedView::new();
        for patch in journal.patches_since(0)? {
            view.apply(&patch);
        }
        debug!(%dir_id, %kind, version = view.version(), "folder opened");
        Ok(Self {
            dir_id,
            kind,
            journal,
            state: Mutex::new(FolderState {
                buffer: ReassemblyBuffer::new(),
                view,
            }),
        })
    }

    /// An empty folder kept in memory.
    #[must_use]
    pub fn in_memory(dir_id: DirId, kind: FolderKind) -> Self {
        Self {
            dir_id,
            kind,
            journal: Journal::in_memory(),
            state: Mutex::new(FolderState {
                buffer: ReassemblyBuffer::new(),
                view: MaterializedView::new(),
            }),
        }
    }

    /// Folder identifier.
    #[must_use]
    pub fn dir_id(&self) -> &DirId {
        &self.dir_id
    }

    /// Folder kind.
    #[must_use]
    pub fn kind(&self) -> FolderKind {
        self.kind
    }

    /// The folder's journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Committed version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.journal.last_version()
    }

    /// Offers a patch received from the server.
    ///
    /// Out-of-order patches are buffered; everything that becomes contiguous
    /// is appended to the journal and applied to the view. A patch behind the
    /// committed version is discarded without touching the journal.
    ///
    /// # Errors
    ///
    /// A journal write failure aborts the drain; patches not yet committed
    /// stay buffered for the next attempt.
    pub fn apply_remote(&self, patch: Patch) -> CoreResult<ApplyReport> {
        let mut state = self.state.lock();
        let committed = self.journal.last_version();
        let outcome = state.buffer.offer(patch, committed);
        if outcome != OfferOutcome::Buffered {
            trace!(dir_id = %self.dir_id, ?outcome, committed, "patch discarded");
            return Ok(ApplyReport {
                outcome,
                applied: Vec::new(),
                pending: state.buffer.len(),
            });
        }

        let ready: Vec<Patch> = state.buffer.drain(committed).collect();
        let mut applied = Vec::with_capacity(ready.len());
        let mut ready = ready.into_iter();
        while let Some(patch) = ready.next() {
            if let Err(e) = self.journal.append_patch(&patch) {
                state.buffer.restore(std::iter::once(patch).chain(ready));
                return Err(e);
            }
            state.view.apply(&patch);
            debug!(
                dir_id = %self.dir_id,
                version = patch.new_version,
                action = %patch.action,
                "patch applied"
            );
            applied.push(patch);
        }

        Ok(ApplyReport {
            outcome,
            applied,
            pending: state.buffer.len(),
        })
    }

    /// Appends a document at the current version. Used by the authority
    /// (server) side, which decides the order of the folder.
    ///
    /// # Errors
    ///
    /// Fails if the journal write fails or the document is too large.
    pub fn append_local(&self, action: Action, header: Header) -> CoreResult<Patch> {
        let mut state = self.state.lock();
        self.append_locked(&mut state, action, header)
    }

    /// Adds a document.
    pub fn add(&self, header: Header) -> CoreResult<Patch> {
        self.append_local(Action::Add, header)
    }

    /// Removes the live document committed at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] if nothing is live there.
    pub fn remove(&self, target: Version) -> CoreResult<Patch> {
        let mut state = self.state.lock();
        if !state.view.contains(target) {
            return Err(CoreError::DocumentNotFound {
                dir_id: self.dir_id.clone(),
                version: target,
            });
        }
        self.append_locked(&mut state, Action::Remove, Header::mark(target))
    }

    fn append_locked(
        &self,
        state: &mut FolderState,
        action: Action,
        header: Header,
    ) -> CoreResult<Patch> {
        let old_version = self.journal.last_version();
        let patch = Patch {
            old_version,
            new_version: old_version + 1,
            action,
            header,
        };
        self.journal.append_patch(&patch)?;
        state.view.apply(&patch);
        Ok(patch)
    }

    /// Every patch after `from_version`, for catching up a subscriber.
    pub fn patches_since(&self, from_version: Version) -> CoreResult<Vec<Patch>> {
        self.journal.patches_since(from_version)
    }

    /// Number of remote patches waiting for a gap to close.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Runs `f` against the materialized view.
    pub fn with_view<R>(&self, f: impl FnOnce(&MaterializedView) -> R) -> R {
        f(&self.state.lock().view)
    }

    /// Live entries this folder's kind exposes.
    #[must_use]
    pub fn entries(&self) -> Vec<ViewEntry> {
        let kind = self.kind;
        self.with_view(|view| {
            view.entries()
                .filter(|entry| kind.exposes(entry.doc_type()))
                .cloned()
                .collect()
        })
    }

    /// Live sub-folder links.
    #[must_use]
    pub fn directories(&self) -> Vec<DirectoryRecord> {
        self.with_view(|view| view.directories().collect())
    }

    /// Live file records.
    #[must_use]
    pub fn files(&self) -> Vec<FileRecord> {
        self.with_view(|view| view.files().collect())
    }

    /// Returns true if `user` may subscribe.
    #[must_use]
    pub fn allows(&self, user: &str) -> bool {
        self.with_view(|view| match view.allowed_users() {
            Some(users) => users.iter().any(|allowed| allowed == user),
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdir_storage::InMemoryBackend;

    fn folder() -> Folder {
        Folder::in_memory(DirId::new("X"), FolderKind::Plain)
    }

    #[test]
    fn remove_arriving_before_add() {
        let folder = folder();
        let add = Patch::add(0, Header::new().with("subject", "hi"));
        let remove = Patch::remove(1, 1);

        let report = folder.apply_remote(remove).unwrap();
        assert_eq!(report.outcome, OfferOutcome::Buffered);
        assert!(report.applied.is_empty());
        assert_eq!(report.pending, 1);
        assert_eq!(folder.version(), 0);

        let report = folder.apply_remote(add).unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(folder.version(), 2);
        assert!(folder.with_view(|view| view.is_empty()));
    }

    #[test]
    fn retransmit_never_touches_journal() {
        let folder = folder();
        let patch = Patch::add(0, Header::new());
        folder.apply_remote(patch.clone()).unwrap();
        let report = folder.apply_remote(patch).unwrap();
        assert_eq!(report.outcome, OfferOutcome::Stale);
        assert_eq!(folder.journal().len(), 1);
    }

    #[test]
    fn kind_gates_entries() {
        let plain = folder();
        plain.add(Header::new().with("subject", "mail")).unwrap();
        plain.add(Header::file("a", "d", "r")).unwrap();
        plain.add(Header::permission(["alice"])).unwrap();
        assert_eq!(plain.entries().len(), 1);

        let mail = Folder::in_memory(DirId::new("M"), FolderKind::Mail);
        mail.add(Header::new().with("subject", "mail")).unwrap();
        assert_eq!(mail.entries().len(), 1);

        let rules = Folder::in_memory(DirId::new("R"), FolderKind::Rules);
        rules.add(Header::new().with("type", "rule")).unwrap();
        assert_eq!(rules.entries().len(), 1);
    }

    #[test]
    fn remove_requires_live_target() {
        let folder = folder();
        let added = folder.add(Header::new()).unwrap();
        folder.remove(added.new_version).unwrap();
        assert!(matches!(
            folder.remove(added.new_version),
            Err(CoreError::DocumentNotFound { .. })
        ));
    }

    #[test]
    fn permissions() {
        let folder = folder();
        assert!(folder.allows("anyone"));
        folder.add(Header::permission(["alice"])).unwrap();
        assert!(folder.allows("alice"));
        assert!(!folder.allows("bob"));
    }

    #[test]
    fn reopen_rebuilds_view() {
        let log = InMemoryBackend::new();
        {
            let folder = Folder::open(
                DirId::new("X"),
                FolderKind::Plain,
                Box::new(log.clone()),
                JournalConfig::default(),
            )
            .unwrap();
            folder.add(Header::directory("a").with("dirId", "1")).unwrap();
            folder.add(Header::directory("b").with("dirId", "2")).unwrap();
            folder.remove(1).unwrap();
        }
        let folder = Folder::open(
            DirId::new("X"),
            FolderKind::Plain,
            Box::new(log),
            JournalConfig::default(),
        )
        .unwrap();
        assert_eq!(folder.version(), 3);
        let names: Vec<_> = folder.directories().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn kind_of_directory() {
        assert_eq!(FolderKind::of_directory(&Header::directory("x")), FolderKind::Plain);
        let mail = Header::directory("x").with(FIELD_KIND, "mail");
        assert_eq!(FolderKind::of_directory(&mail), FolderKind::Mail);
        for kind in [FolderKind::Plain, FolderKind::Mail, FolderKind::Rules] {
            assert_eq!(FolderKind::of_directory(&kind.directory("x")), kind);
        }
    }
}
