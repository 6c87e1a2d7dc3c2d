//! Materialized view of a folder: the documents still live at a version.

use mdir_codec::{DocType, Header, FIELD_ALLOW};
use mdir_protocol::{Action, Patch, Version};
use std::collections::BTreeMap;

/// A live document and the marks attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    /// Version the document was committed at.
    pub version: Version,
    /// The document.
    pub header: Header,
    /// Mark documents targeting this entry, in commit order.
    pub marks: Vec<Header>,
}

impl ViewEntry {
    /// Document type of the entry.
    #[must_use]
    pub fn doc_type(&self) -> DocType {
        self.header.doc_type()
    }
}

/// A file record as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// File name.
    pub name: String,
    /// Content digest.
    pub digest: String,
    /// Content store reference.
    pub resource: String,
    /// Version holding the file document.
    pub version: Version,
}

/// A sub-folder link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    /// Entry name.
    pub name: String,
    /// Folder identifier, absent until the server fills it in.
    pub dir_id: Option<String>,
    /// Version holding the directory document.
    pub version: Version,
}

/// The result of replaying a journal.
#[derive(Debug, Clone, Default)]
pub struct MaterializedView {
    entries: BTreeMap<Version, ViewEntry>,
    version: Version,
}

impl MaterializedView {
    /// An empty view at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Version the view reflects.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Applies a committed patch.
    ///
    /// - ADD of a mark attaches it to its target (dropped if the target is
    ///   gone).
    /// - ADD of anything else creates an entry at `new_version`.
    /// - REMOVE erases the entry its mark targets.
    pub fn apply(&mut self, patch: &Patch) {
        match patch.action {
            Action::Add if patch.header.doc_type() == DocType::Mark => {
                if let Some(entry) = patch
                    .header
                    .target()
                    .and_then(|target| self.entries.get_mut(&target))
                {
                    entry.marks.push(patch.header.clone());
                }
            }
            Action::Add => {
                self.entries.insert(
                    patch.new_version,
                    ViewEntry {
                        version: patch.new_version,
                        header: patch.header.clone(),
                        marks: Vec::new(),
                    },
                );
            }
            Action::Remove => {
                if let Some(target) = patch.header.target() {
                    self.entries.remove(&target);
                }
            }
        }
        self.version = patch.new_version;
    }

    /// The live entry at `version`.
    #[must_use]
    pub fn get(&self, version: Version) -> Option<&ViewEntry> {
        self.entries.get(&version)
    }

    /// Returns true if a document is live at `version`.
    #[must_use]
    pub fn contains(&self, version: Version) -> bool {
        self.entries.contains_key(&version)
    }

    /// All live entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &ViewEntry> {
        self.entries.values()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live directory entries.
    pub fn directories(&self) -> impl Iterator<Item = DirectoryRecord> + '_ {
        self.entries_of(DocType::Directory).filter_map(|entry| {
            Some(DirectoryRecord {
                name: entry.header.name()?.to_string(),
                dir_id: entry.header.dir_id().map(str::to_string),
                version: entry.version,
            })
        })
    }

    /// The oldest live directory entry called `name`.
    #[must_use]
    pub fn directory_by_name(&self, name: &str) -> Option<DirectoryRecord> {
        self.directories().find(|dir| dir.name == name)
    }

    /// Live file records.
    pub fn files(&self) -> impl Iterator<Item = FileRecord> + '_ {
        self.entries_of(DocType::File).filter_map(|entry| {
            Some(FileRecord {
                name: entry.header.name()?.to_string(),
                digest: entry.header.digest()?.to_string(),
                resource: entry.header.resource().unwrap_or_default().to_string(),
                version: entry.version,
            })
        })
    }

    /// The newest live file record called `name`.
    #[must_use]
    pub fn file_by_name(&self, name: &str) -> Option<FileRecord> {
        self.files().filter(|file| file.name == name).last()
    }

    /// Users allowed by the folder's permission documents.
    ///
    /// `None` means the folder carries no permission document and is open.
    #[must_use]
    pub fn allowed_users(&self) -> Option<Vec<String>> {
        let mut found = false;
        let mut users = Vec::new();
        for entry in self.entries_of(DocType::Permission) {
            found = true;
            users.extend(entry.header.get_all(FIELD_ALLOW).map(str::to_string));
        }
        found.then_some(users)
    }

    fn entries_of(&self, doc_type: DocType) -> impl Iterator<Item = &ViewEntry> {
        self.entries
            .values()
            .filter(move |entry| entry.doc_type() == doc_type)
    }
}
