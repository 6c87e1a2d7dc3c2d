//! Content digests.

use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hex-encoded SHA-256 of some content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wraps an already computed hex digest.
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of a byte slice.
#[must_use]
pub fn digest_bytes(data: &[u8]) -> Digest {
    Digest(hex::encode(Sha256::digest(data)))
}

/// Digest of everything `reader` yields.
pub fn digest_reader(mut reader: impl Read) -> CoreResult<Digest> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(Digest(hex::encode(hasher.finalize())))
}

/// Digest of a file's content.
pub fn digest_file(path: &Path) -> CoreResult<Digest> {
    digest_reader(File::open(path)?)
}
