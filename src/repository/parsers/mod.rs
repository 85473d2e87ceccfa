// src/repository/parsers/mod.rs

//! Repository metadata parsers
//!
//! Only the Debian archive format is understood: `Release`/`InRelease`
//! files and `Packages` indexes.

pub mod debian;

pub use debian::{ReleaseFile, decompress_index, parse_packages, parse_release};
