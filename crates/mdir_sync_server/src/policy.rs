//! Arbitration of folder creation.
//!
//! Two clients may create a folder with the same name in the same parent
//! while offline. What the server does with the second creation is a
//! policy decision.

use crate::error::{ServerError, ServerResult};
use mdir_core::{DirId, Folder};
use mdir_protocol::Version;

/// Outcome of arbitrating one folder creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Creation {
    /// Append a new directory entry with a fresh identifier.
    Create,
    /// Answer with an entry that already exists.
    Existing {
        /// Identifier of the existing folder.
        dir_id: DirId,
        /// Version of its directory entry.
        version: Version,
    },
}

/// Decides what a directory creation named `name` in `parent` does.
pub trait CreationPolicy: Send + Sync {
    /// Arbitrates one creation.
    ///
    /// # Errors
    ///
    /// An error refuses the creation; its status code answers the PUT.
    fn decide(&self, parent: &Folder, name: &str) -> ServerResult<Creation>;
}

fn existing(parent: &Folder, name: &str) -> Option<Creation> {
    let record = parent.with_view(|view| view.directory_by_name(name))?;
    Some(Creation::Existing {
        dir_id: DirId::new(record.dir_id?),
        version: record.version,
    })
}

/// Every creator of a name gets the same folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeByName;

impl CreationPolicy for MergeByName {
    fn decide(&self, parent: &Folder, name: &str) -> ServerResult<Creation> {
        Ok(existing(parent, name).unwrap_or(Creation::Create))
    }
}

/// Every creation makes a new folder, even under a taken name.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCreate;

impl CreationPolicy for AlwaysCreate {
    fn decide(&self, _parent: &Folder, _name: &str) -> ServerResult<Creation> {
        Ok(Creation::Create)
    }
}

/// A taken name is refused with 409; the client re-resolves it by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectDuplicates;

impl CreationPolicy for RejectDuplicates {
    fn decide(&self, parent: &Folder, name: &str) -> ServerResult<Creation> {
        match existing(parent, name) {
            Some(Creation::Existing { dir_id, .. }) => Err(ServerError::Conflict(format!(
                "{name:?} already exists as folder {dir_id}"
            ))),
            _ => Ok(Creation::Create),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdir_codec::Header;
    use mdir_core::FolderKind;

    fn parent() -> Folder {
        let folder = Folder::in_memory(DirId::new("P"), FolderKind::Plain);
        folder
            .add(Header::directory("shared").with("dirId", "7"))
            .unwrap();
        folder
    }

    #[test]
    fn merge_returns_existing() {
        let parent = parent();
        assert_eq!(
            MergeByName.decide(&parent, "shared").unwrap(),
            Creation::Existing {
                dir_id: DirId::new("7"),
                version: 1
            }
        );
        assert_eq!(MergeByName.decide(&parent, "new").unwrap(), Creation::Create);
    }

    #[test]
    fn always_create_ignores_names() {
        assert_eq!(AlwaysCreate.decide(&parent(), "shared").unwrap(), Creation::Create);
    }

    #[test]
    fn reject_duplicates_conflicts() {
        let parent = parent();
        let err = RejectDuplicates.decide(&parent, "shared").unwrap_err();
        assert_eq!(err.status_code(), mdir_protocol::STATUS_CONFLICT);
        assert_eq!(RejectDuplicates.decide(&parent, "new").unwrap(), Creation::Create);
    }
}
