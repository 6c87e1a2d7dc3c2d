//! Header documents.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Selects the document type explicitly.
pub const FIELD_TYPE: &str = "type";
/// Human readable name of a directory or file entry.
pub const FIELD_NAME: &str = "name";
/// Identifier of the folder a directory entry points to.
pub const FIELD_DIR_ID: &str = "dirId";
/// Content digest of a file body.
pub const FIELD_DIGEST: &str = "digest";
/// Content store reference of a file body.
pub const FIELD_RESOURCE: &str = "resource";
/// Version a mark refers to.
pub const FIELD_TARGET: &str = "target";
/// User allowed to subscribe to a folder carrying a permission document.
pub const FIELD_ALLOW: &str = "allow";

/// The implicit type of a header document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocType {
    /// Entry pointing at a sub-folder.
    Directory,
    /// A file body, referenced by digest and resource.
    File,
    /// A mail message.
    Mail,
    /// Reference to another document by version.
    Mark,
    /// A distribution rule.
    DistributionRule,
    /// Restricts who may subscribe to the folder.
    Permission,
}

impl DocType {
    /// Value used in the `type` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DocType::Directory => "dir",
            DocType::File => "file",
            DocType::Mail => "mail",
            DocType::Mark => "mark",
            DocType::DistributionRule => "rule",
            DocType::Permission => "perm",
        }
    }

    /// Parses a `type` field value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dir" => Some(DocType::Directory),
            "file" => Some(DocType::File),
            "mail" => Some(DocType::Mail),
            "mark" => Some(DocType::Mark),
            "rule" => Some(DocType::DistributionRule),
            "perm" => Some(DocType::Permission),
            _ => None,
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered multimap of field name to value.
///
/// Names are case-sensitive, duplicates are allowed and insertion order is
/// preserved. Two headers are equal only if they hold the same fields in the
/// same order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header {
    fields: Vec<(String, String)>,
}

impl Header {
    /// Creates an empty header.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Header::push`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// A directory entry named `name` (the server fills in `dirId`).
    #[must_use]
    pub fn directory(name: impl Into<String>) -> Self {
        Self::new()
            .with(FIELD_TYPE, DocType::Directory.as_str())
            .with(FIELD_NAME, name)
    }

    /// A file entry.
    #[must_use]
    pub fn file(
        name: impl Into<String>,
        digest: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::new()
            .with(FIELD_TYPE, DocType::File.as_str())
            .with(FIELD_NAME, name)
            .with(FIELD_DIGEST, digest)
            .with(FIELD_RESOURCE, resource)
    }

    /// A mark referring to the document committed at `target`.
    #[must_use]
    pub fn mark(target: i64) -> Self {
        Self::new()
            .with(FIELD_TYPE, DocType::Mark.as_str())
            .with(FIELD_TARGET, target.to_string())
    }

    /// A permission document allowing exactly `users`.
    #[must_use]
    pub fn permission<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        users.into_iter().fold(
            Self::new().with(FIELD_TYPE, DocType::Permission.as_str()),
            |header, user| header.with(FIELD_ALLOW, user),
        )
    }

    /// Appends a field, keeping any existing field of the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replaces every field named `name` with a single one holding `value`.
    ///
    /// The new field takes the position of the first replaced one, or goes
    /// last if there was none.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter().position(|(n, _)| n == name) {
            Some(first) => {
                self.fields[first].1 = value;
                let mut index = 0;
                self.fields.retain(|(n, _)| {
                    let keep = n != name || index == first;
                    index += 1;
                    keep
                });
            }
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Removes every field named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|(n, _)| n != name);
        before - self.fields.len()
    }

    /// First value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All fields, in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the header has no field.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The document type.
    ///
    /// An explicit, known `type` field wins. Otherwise the type is inferred
    /// from the fields present: `dirId` makes a directory, `digest` a file,
    /// `target` a mark; anything else is mail.
    #[must_use]
    pub fn doc_type(&self) -> DocType {
        if let Some(explicit) = self.get(FIELD_TYPE).and_then(DocType::parse) {
            return explicit;
        }
        if self.get(FIELD_DIR_ID).is_some() {
            DocType::Directory
        } else if self.get(FIELD_DIGEST).is_some() {
            DocType::File
        } else if self.get(FIELD_TARGET).is_some() {
            DocType::Mark
        } else {
            DocType::Mail
        }
    }

    /// The `name` field.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.get(FIELD_NAME)
    }

    /// The `dirId` field.
    #[must_use]
    pub fn dir_id(&self) -> Option<&str> {
        self.get(FIELD_DIR_ID)
    }

    /// The `digest` field.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.get(FIELD_DIGEST)
    }

    /// The `resource` field.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.get(FIELD_RESOURCE)
    }

    /// The `target` field parsed as a version.
    #[must_use]
    pub fn target(&self) -> Option<i64> {
        self.get(FIELD_TARGET).and_then(|v| v.trim().parse().ok())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Header {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_and_order_preserved() {
        let header = Header::new()
            .with("to", "alice")
            .with("subject", "hi")
            .with("to", "bob");

        assert_eq!(header.len(), 3);
        assert_eq!(header.get("to"), Some("alice"));
        assert_eq!(header.get_all("to").collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(header.get("To"), None);
    }

    #[test]
    fn set_collapses_duplicates_in_place() {
        let mut header = Header::new()
            .with("a", "1")
            .with("b", "2")
            .with("a", "3");
        header.set("a", "9");

        let fields: Vec<_> = header.iter().collect();
        assert_eq!(fields, vec![("a", "9"), ("b", "2")]);

        header.set("c", "new");
        assert_eq!(header.iter().last(), Some(("c", "new")));
    }

    #[test]
    fn remove_counts() {
        let mut header = Header::new().with("x", "1").with("x", "2").with("y", "3");
        assert_eq!(header.remove("x"), 2);
        assert_eq!(header.remove("x"), 0);
        assert_eq!(header.len(), 1);
    }

    #[test]
    fn explicit_type_wins() {
        let header = Header::new().with("type", "perm").with("dirId", "7");
        assert_eq!(header.doc_type(), DocType::Permission);
    }

    #[test]
    fn inferred_types() {
        assert_eq!(Header::new().with("dirId", "7").doc_type(), DocType::Directory);
        assert_eq!(Header::new().with("digest", "ab").doc_type(), DocType::File);
        assert_eq!(Header::new().with("target", "3").doc_type(), DocType::Mark);
        assert_eq!(Header::new().with("subject", "x").doc_type(), DocType::Mail);
        assert_eq!(Header::new().with("type", "bogus").doc_type(), DocType::Mail);
    }

    #[test]
    fn constructors() {
        let dir = Header::directory("inbox");
        assert_eq!(dir.doc_type(), DocType::Directory);
        assert_eq!(dir.name(), Some("inbox"));

        let file = Header::file("a.txt", "d1", "r1");
        assert_eq!(file.doc_type(), DocType::File);
        assert_eq!(file.digest(), Some("d1"));
        assert_eq!(file.resource(), Some("r1"));

        let mark = Header::mark(12);
        assert_eq!(mark.doc_type(), DocType::Mark);
        assert_eq!(mark.target(), Some(12));

        let perm = Header::permission(["alice", "bob"]);
        assert_eq!(perm.get_all(FIELD_ALLOW).count(), 2);
    }

    #[test]
    fn doc_type_strings() {
        for ty in [
            DocType::Directory,
            DocType::File,
            DocType::Mail,
            DocType::Mark,
            DocType::DistributionRule,
            DocType::Permission,
        ] {
            assert_eq!(DocType::parse(ty.as_str()), Some(ty));
        }
    }
}
