//! # mdir storage
//!
//! Append-only byte logs backing mdir folder journals.
//!
//! A folder journal never rewrites history: patches are appended, read back
//! by offset, and the tail is only ever cut when recovery finds a record that
//! a crash left half-written. Backends here are therefore **opaque logs**;
//! they know nothing about patches, versions or documents.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - for tests and servers running without a data directory
//! - [`FileBackend`] - one file per folder, guarded by an advisory lock
//!
//! ## Example
//!
//! ```rust
//! use mdir_storage::{InMemoryBackend, LogBackend};
//!
//! let mut log = InMemoryBackend::new();
//! let offset = log.append(b"patch bytes").unwrap();
//! assert_eq!(log.read_at(offset, 5).unwrap(), b"patch");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::LogBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
