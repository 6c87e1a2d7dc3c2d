//! Sync map: name to digest as of the last successful reconciliation.

use crate::digest::Digest;
use crate::error::CoreResult;
use crate::mirror::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Persisted snapshot of what this client believes is in sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMap {
    entries: BTreeMap<String, Digest>,
}

impl SyncMap {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the map, or returns an empty one if the file does not exist.
    pub fn load(path: &Path) -> CoreResult<Self> {
        match std::fs::read(path) {
            Ok(data) if data.is_empty() => Ok(Self::new()),
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the map atomically.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)
    }

    /// Digest recorded for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Digest> {
        self.entries.get(name)
    }

    /// Records `digest` for `name`.
    pub fn insert(&mut self, name: impl Into<String>, digest: Digest) {
        self.entries.insert(name.into(), digest);
    }

    /// Forgets `name`.
    pub fn remove(&mut self, name: &str) -> Option<Digest> {
        self.entries.remove(name)
    }

    /// Names in the map.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// All entries, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Digest)> {
        self.entries.iter().map(|(name, digest)| (name.as_str(), digest))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
