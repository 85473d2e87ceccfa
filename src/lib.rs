// src/lib.rs

//! debpool: Debian repository manager
//!
//! Keeps `.deb` packages in a content-addressed pool and groups them into
//! local repositories, mirrors of remote archives and immutable snapshots.
//! Any of those can be published as a signed apt repository.
//!
//! # Architecture
//!
//! - Store: every entity is a JSON value in one SQLite key-value table
//! - Ref lists: repos and snapshots are sorted sets of package refs,
//!   combined with merge/subtract/diff
//! - Pool: package files stored once, keyed by checksum
//! - Tasks: mutating operations run on a scheduler that admits a task only
//!   when none of its resource keys is held by a running task
//! - Publishing: index files are staged, signed and swapped in at once;
//!   prefix cleanup only removes files no published repo still uses

pub mod config;
pub mod context;
pub mod db;
mod error;
pub mod packages;
pub mod pool;
pub mod publish;
pub mod repository;
pub mod signer;
pub mod task;

pub use config::Config;
pub use context::Context;
pub use error::{Error, ErrorKind, Result};
