// src/pool/mod.rs

//! Package file storage
//!
//! The pool holds each package file exactly once, addressed by its SHA256.
//! Published storages expose pool files under `pool/<component>/...` in
//! their public trees.

pub mod checksum;
pub mod package_pool;
pub mod storage;

pub use checksum::{ChecksumCollection, ChecksumInfo, ChecksumStorage};
pub use package_pool::PackagePool;
pub use storage::{
    LinkMethod, LinkOutcome, LocalPublishedStorage, PublishedStorage, StorageProvider,
};
