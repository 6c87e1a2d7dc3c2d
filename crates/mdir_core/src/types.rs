//! Core type definitions for mdir.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix reserved for identifiers the server has not assigned yet.
pub const TRANSIENT_PREFIX: char = '_';

/// Identifier of a folder.
///
/// Durable identifiers are assigned by the server. Transient identifiers
/// start with [`TRANSIENT_PREFIX`], are synthesized locally for folders
/// created before the server acknowledged them, and are never sent over the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirId(String);

impl DirId {
    /// Wraps an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Synthesizes a fresh, locally unique transient identifier.
    #[must_use]
    pub fn transient() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{TRANSIENT_PREFIX}{}", &id[..12]))
    }

    /// Returns true for identifiers not yet confirmed by the server.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.0.starts_with(TRANSIENT_PREFIX)
    }

    /// The identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DirId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DirId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for DirId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_ids() {
        let a = DirId::transient();
        let b = DirId::transient();
        assert!(a.is_transient());
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 13);
        assert!(!DirId::new("42").is_transient());
    }

    #[test]
    fn serde_is_a_plain_string() {
        let id = DirId::new("42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
        assert_eq!(format!("{id}"), "42");
    }
}
