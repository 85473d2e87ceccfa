// src/publish/mod.rs

//! Published repositories
//!
//! A published repo exposes the packages of local repos or snapshots, one
//! per component, as an apt-consumable tree under a storage prefix:
//!
//! ```text
//! <prefix>/dists/<distribution>/Release
//! <prefix>/dists/<distribution>/<component>/binary-<arch>/Packages{,.gz,.xz}
//! <prefix>/pool/<component>/<dir>/<file>.deb
//! ```

pub mod index;
pub mod pipeline;
pub mod published;

pub use index::IndexFiles;
pub use pipeline::{PublishOptions, PublishReport, Publisher};
pub use published::{PublishedRepo, PublishedRepoCollection, SourceKind, prefix_resource_key};
