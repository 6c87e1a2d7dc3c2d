//! # mdir Sync Server
//!
//! Reference server for mdir clients.
//!
//! This crate provides:
//! - Sessions over TCP or in-process channels
//! - Subscriptions with catch-up and patch broadcast
//! - Folder creation arbitration behind [`CreationPolicy`]
//! - An LRU-bounded folder cache over memory or on-disk journals
//!
//! # Ordering
//!
//! A patch committed by a command reaches every subscriber, including the
//! issuing session, before that command's response. The catch-up patches of
//! a SUB precede its response. Clients rely on this: a success answer means
//! the resulting patch is already in their stream.
//!
//! # Permissions
//!
//! A folder holding a permission document only accepts subscriptions from
//! the users it names. TCP sessions carry no credentials and run as
//! [`ANONYMOUS_USER`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod policy;
mod server;

pub use config::{ServerConfig, DEFAULT_FOLDER_CACHE_CAPACITY, DEFAULT_ROOT_DIR_ID};
pub use error::{ServerError, ServerResult};
pub use handler::{Flow, HandlerContext, RequestHandler, Session, SessionId};
pub use policy::{AlwaysCreate, Creation, CreationPolicy, MergeByName, RejectDuplicates};
pub use server::{SyncServer, ANONYMOUS_USER};
