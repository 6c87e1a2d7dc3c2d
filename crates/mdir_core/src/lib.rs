//! # mdir Core
//!
//! Folder engine for mdir.
//!
//! This crate provides:
//! - [`Journal`] - durable, gapless, append-only patch history of one folder
//! - [`ReassemblyBuffer`] - holds out-of-order patches until their gap closes
//! - [`Folder`] - journal, buffer and [`MaterializedView`] behind one lock
//! - [`FolderRegistry`] - one in-memory folder per identifier, LRU-bounded
//! - [`MirrorRoot`] / [`FolderMirror`] - the client's on-disk mirror layout
//! - [`SyncMap`] and [`Digest`] - inputs of the file reconciler
//!
//! ## Example
//!
//! ```rust
//! use mdir_codec::Header;
//! use mdir_core::{DirId, Folder, FolderKind};
//! use mdir_protocol::Patch;
//!
//! let folder = Folder::in_memory(DirId::new("X"), FolderKind::Plain);
//!
//! // a REMOVE that overtook its ADD is held back
//! folder.apply_remote(Patch::remove(1, 1)).unwrap();
//! assert_eq!(folder.version(), 0);
//!
//! folder.apply_remote(Patch::add(0, Header::new().with("subject", "hi"))).unwrap();
//! assert_eq!(folder.version(), 2);
//! assert!(folder.with_view(|view| view.is_empty()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod digest;
mod error;
mod folder;
pub mod journal;
pub mod mirror;
mod reassembly;
mod registry;
mod sync_map;
mod types;
mod view;

pub use config::{JournalConfig, DEFAULT_MAX_DOCUMENT_SIZE};
pub use digest::{digest_bytes, digest_file, digest_reader, Digest};
pub use error::{CoreError, CoreResult};
pub use folder::{ApplyReport, Folder, FolderKind, FIELD_KIND};
pub use journal::{Journal, RecoveryReport};
pub use mirror::{backup_name, write_atomic, FolderMirror, MirrorRoot, StagedPut, StagedRemoval};
pub use reassembly::{Drain, OfferOutcome, ReassemblyBuffer};
pub use registry::{
    DirectoryFolderStorage, FolderRegistry, FolderStorage, MemoryFolderStorage, JOURNAL_FILE_NAME,
};
pub use sync_map::SyncMap;
pub use types::{DirId, TRANSIENT_PREFIX};
pub use view::{DirectoryRecord, FileRecord, MaterializedView, ViewEntry};
