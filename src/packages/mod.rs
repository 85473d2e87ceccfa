// src/packages/mod.rs

//! Debian package metadata
//!
//! This module provides the package model, its reference identity, the
//! control-stanza format shared by `.deb` files and repository indexes, and
//! the set algebra over lists of package references.

pub mod collection;
pub mod deb;
pub mod package;
pub mod reflist;
pub mod stanza;
pub mod version;

pub use collection::PackageCollection;
pub use package::{Package, PackageFile, PackageRef};
pub use reflist::{PackageDiff, PackageRefList};
pub use stanza::Stanza;
pub use version::compare_versions;
