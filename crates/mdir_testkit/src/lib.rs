//! # mdir Testkit
//!
//! Test utilities for mdir.
//!
//! This crate provides:
//! - Temporary mirrors and journals
//! - Property-based test generators using proptest
//! - Sample patch chains and folder scenarios
//!
//! ## Usage
//!
//! ```rust
//! use mdir_testkit::prelude::*;
//!
//! with_temp_mirror(|mirror| {
//!     mirror.write_file("7", "a.txt", b"hello");
//!     assert_eq!(mirror.folder("7").user_files().unwrap(), vec!["a.txt"]);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
