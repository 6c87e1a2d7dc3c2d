//! Patches: one add or remove step in a folder's history.

use crate::error::{ProtocolError, ProtocolResult};
use mdir_codec::Header;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A folder version. Starts at 0 and only grows.
pub type Version = i64;

/// What a patch does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Adds a document.
    Add,
    /// Removes the document named by the patch's mark.
    Remove,
}

impl Action {
    /// Single-character wire code.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Action::Add => 'a',
            Action::Remove => 'r',
        }
    }

    /// Parses a wire code.
    #[must_use]
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'a' => Some(Action::Add),
            'r' => Some(Action::Remove),
            _ => None,
        }
    }

    /// Byte stored in journal records.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Action::Add => 1,
            Action::Remove => 2,
        }
    }

    /// Parses a journal record byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Action::Add),
            2 => Some(Action::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => f.write_str("ADD"),
            Action::Remove => f.write_str("REMOVE"),
        }
    }
}

/// An immutable step from `old_version` to `new_version`.
///
/// Normally `new_version == old_version + 1`. A wider span records versions
/// the issuer skipped on purpose; they count towards the folder version but
/// hold no document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// Version the folder must be at for this patch to apply.
    pub old_version: Version,
    /// Version the folder is at once the patch is applied.
    pub new_version: Version,
    /// Add or remove.
    pub action: Action,
    /// The document. For removals, a mark naming the target version.
    pub header: Header,
}

impl Patch {
    /// Creates a patch, checking the version span.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidVersionSpan`] unless
    /// `0 <= old_version < new_version`.
    pub fn new(
        old_version: Version,
        new_version: Version,
        action: Action,
        header: Header,
    ) -> ProtocolResult<Self> {
        if old_version < 0 || new_version <= old_version {
            return Err(ProtocolError::InvalidVersionSpan {
                old: old_version,
                new: new_version,
            });
        }
        Ok(Self {
            old_version,
            new_version,
            action,
            header,
        })
    }

    /// A one-step ADD on top of `old_version`.
    #[must_use]
    pub fn add(old_version: Version, header: Header) -> Self {
        Self {
            old_version,
            new_version: old_version + 1,
            action: Action::Add,
            header,
        }
    }

    /// A one-step REMOVE of the document committed at `target`.
    #[must_use]
    pub fn remove(old_version: Version, target: Version) -> Self {
        Self {
            old_version,
            new_version: old_version + 1,
            action: Action::Remove,
            header: Header::mark(target),
        }
    }

    /// Number of versions skipped before this patch's own version.
    #[must_use]
    pub fn nb_deleted(&self) -> i64 {
        self.new_version - self.old_version - 1
    }

    /// Returns true if the patch skips versions.
    #[must_use]
    pub fn is_gap(&self) -> bool {
        self.nb_deleted() > 0
    }

    /// The version a REMOVE patch targets.
    #[must_use]
    pub fn remove_target(&self) -> Option<Version> {
        match self.action {
            Action::Remove => self.header.target(),
            Action::Add => None,
        }
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{}",
            self.action, self.old_version, self.new_version
        )
    }
}
