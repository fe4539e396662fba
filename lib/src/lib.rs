//! # Copy between directory trees and tar streams
//!
//! This crate moves content between a host directory tree, treated as a
//! virtual root filesystem, and tar streams.  It is the layer a container
//! image builder uses to implement `COPY`/`ADD`: inspecting build context
//! content ([`stat`]), archiving it ([`get`]) and extracting archives into
//! a root filesystem ([`put`]).
//!
//! Every operation behaves as if it ran under `chroot(root)`.  When the
//! process is privileged on Linux the work is done by a helper subprocess
//! which really does chroot (see [`Isolation`]); otherwise symlinks are
//! resolved by [`resolve::resolve`], which re-anchors them at the root.
//! The resolver is not safe against concurrent modification of the tree.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
type Result<T> = anyhow::Result<T>;

pub mod archive;
pub mod cli;
mod copier;
pub use copier::*;
pub mod exclude;
mod eval;
pub mod hardlink;
pub mod idmap;
pub mod isolation;
mod mkdir;
mod platform;
mod request;
pub use request::*;
pub mod resolve;
mod stat;
mod tar;
mod tokio_util;
mod xattrs;
