//! # mdir Protocol
//!
//! Types shared by mdir clients and servers, and their line encoding.
//!
//! This crate provides:
//! - [`Patch`], [`Action`] and [`Version`] for folder history
//! - [`Request`] and [`Response`] for sequence-numbered commands
//! - [`ServerMessage`] for the multiplexed server-to-client stream
//! - [`MessageDecoder`] for incremental decoding from a byte buffer
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod command;
mod error;
mod message;
mod patch;
mod wire;

pub use command::{
    CommandKind, PutAck, Request, Response, Seq, STATUS_BAD_REQUEST, STATUS_CONFLICT,
    STATUS_FORBIDDEN, STATUS_NOT_FOUND, STATUS_OK, STATUS_SERVER_ERROR,
};
pub use error::{ProtocolError, ProtocolResult};
pub use message::ServerMessage;
pub use patch::{Action, Patch, Version};
pub use wire::{validate_dir_id, MessageDecoder, WireMessage, DEFAULT_MAX_LINE};
