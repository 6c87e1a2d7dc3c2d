//! # mdir Sync Engine
//!
//! Client side of mdir synchronization.
//!
//! This crate provides:
//! - [`CommandTracker`]: sequence-numbered commands with timeout and re-issue
//! - [`FolderTree`]: path to folder links, including transient identifiers
//!   for folders created offline
//! - [`reconcile`]: content-addressed reconciliation of a local mirror
//! - [`Transport`] implementations over TCP and in-process channels
//! - [`SyncClient`]: the connector, reader and writer tasks tying it together
//!
//! ## Key Invariants
//!
//! - At most one live command per `(kind, path)`
//! - Patches for one folder are applied in version order, never concurrently
//! - A transient folder identifier never reaches the server
//! - Reconciliation never drops a local change silently: conflicts keep the
//!   local copy under a backup name
//!
//! ## Example
//!
//! ```rust,no_run
//! use mdir_sync_engine::{LocalContentStore, SyncClient, SyncConfig, TcpTransport};
//! use std::sync::Arc;
//!
//! # async fn example() -> mdir_sync_engine::SyncResult<()> {
//! let content = Arc::new(LocalContentStore::open("/srv/mdir/content")?);
//! let config = SyncConfig::new("/home/alice/mdir", "alice");
//! let client = SyncClient::new(config, TcpTransport::new("sync.example.org:4410"), content)?;
//!
//! client.create_folder("projects")?;
//! client.run().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod client;
mod config;
mod content;
mod error;
pub mod reconcile;
mod tracker;
mod transport;
mod tree;

pub use client::{SyncClient, SyncStats};
pub use config::{
    RetryConfig, SyncConfig, DEFAULT_COMMAND_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_ROOT_DIR_ID,
};
pub use content::{ContentStore, LocalContentStore};
pub use error::{SyncError, SyncResult};
pub use reconcile::{Decision, Plan, PlanEntry, ReconcileReport, Reconciler};
pub use tracker::{Command, CommandState, CommandTracker, Finalizer, IssueOutcome};
pub use transport::{ChannelTransport, Connection, TcpTransport, Transport};
pub use tree::{Discovery, FolderTree, PendingCreation};
