// src/pool/checksum.rs

//! File checksums (size, MD5, SHA1, SHA256, SHA512) and their cache

use crate::db::Database;
use crate::error::{Error, Result};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Checksums of one file as they appear in Debian indexes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumInfo {
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub md5: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha1: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha512: String,
}

/// Writer feeding every digest at once
struct MultiHasher {
    size: u64,
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
}

impl MultiHasher {
    fn new() -> Self {
        Self {
            size: 0,
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha512: Sha512::new(),
        }
    }

    fn finish(self) -> ChecksumInfo {
        ChecksumInfo {
            size: self.size,
            md5: format!("{:x}", self.md5.finalize()),
            sha1: format!("{:x}", self.sha1.finalize()),
            sha256: format!("{:x}", self.sha256.finalize()),
            sha512: format!("{:x}", self.sha512.finalize()),
        }
    }
}

impl Write for MultiHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.size += buf.len() as u64;
        Digest::update(&mut self.md5, buf);
        Digest::update(&mut self.sha1, buf);
        Digest::update(&mut self.sha256, buf);
        Digest::update(&mut self.sha512, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ChecksumInfo {
    /// Compute all checksums of a file in a single pass
    pub fn compute(path: &Path) -> Result<Self> {
        debug!("Computing checksums for {}", path.display());
        let mut file = File::open(path)?;
        let mut hasher = MultiHasher::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hasher.finish())
    }

    pub fn compute_bytes(data: &[u8]) -> Self {
        let mut hasher = MultiHasher::new();
        // writing to the in-memory hasher cannot fail
        let _ = hasher.write_all(data);
        hasher.finish()
    }

    /// All digests are known
    pub fn is_complete(&self) -> bool {
        !self.md5.is_empty()
            && !self.sha1.is_empty()
            && !self.sha256.is_empty()
            && !self.sha512.is_empty()
    }

    /// Check every digest recorded in `self` against freshly computed `actual`
    ///
    /// Empty digests in `self` are treated as unknown and skipped; the size is
    /// only checked when non-zero or when no digest is known.
    pub fn verify(&self, actual: &ChecksumInfo, path: &str) -> Result<()> {
        let pairs = [
            (&self.sha512, &actual.sha512),
            (&self.sha256, &actual.sha256),
            (&self.sha1, &actual.sha1),
            (&self.md5, &actual.md5),
        ];
        for (expected, found) in pairs {
            if !expected.is_empty() && !expected.eq_ignore_ascii_case(found) {
                return Err(Error::ChecksumMismatch {
                    path: path.to_string(),
                    expected: expected.clone(),
                    actual: found.clone(),
                });
            }
        }

        if self.size != 0 && self.size != actual.size {
            return Err(Error::ChecksumMismatch {
                path: path.to_string(),
                expected: format!("size {}", self.size),
                actual: format!("size {}", actual.size),
            });
        }
        Ok(())
    }
}

/// Cache of checksums for files already in the pool
pub trait ChecksumStorage: Send + Sync {
    fn get(&self, pool_path: &str) -> Result<Option<ChecksumInfo>>;
    fn update(&self, pool_path: &str, info: &ChecksumInfo) -> Result<()>;
    fn delete(&self, pool_path: &str) -> Result<()>;
}

/// Checksum cache persisted under the `C` key prefix
pub struct ChecksumCollection {
    db: Arc<Database>,
}

impl ChecksumCollection {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn key(pool_path: &str) -> Vec<u8> {
        format!("C{}", pool_path).into_bytes()
    }
}

impl ChecksumStorage for ChecksumCollection {
    fn get(&self, pool_path: &str) -> Result<Option<ChecksumInfo>> {
        self.db.get_value(&Self::key(pool_path))
    }

    fn update(&self, pool_path: &str, info: &ChecksumInfo) -> Result<()> {
        let encoded = serde_json::to_vec(info)?;
        self.db.put(&Self::key(pool_path), &encoded)
    }

    fn delete(&self, pool_path: &str) -> Result<()> {
        self.db.delete(&Self::key(pool_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_known_digests() {
        let info = ChecksumInfo::compute_bytes(b"hello\n");
        assert_eq!(info.size, 6);
        assert_eq!(info.md5, "b1946ac92492d2347c6235b4d2611184");
        assert_eq!(info.sha1, "f572d396fae9206628714fb2ce00f72e94f2258f");
        assert_eq!(
            info.sha256,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
        assert!(info.is_complete());
    }

    #[test]
    fn test_compute_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.deb");
        std::fs::write(&path, b"package body").unwrap();

        assert_eq!(
            ChecksumInfo::compute(&path).unwrap(),
            ChecksumInfo::compute_bytes(b"package body")
        );
    }

    #[test]
    fn test_verify_partial_expectations() {
        let actual = ChecksumInfo::compute_bytes(b"data");

        let partial = ChecksumInfo {
            size: 4,
            sha256: actual.sha256.clone(),
            ..Default::default()
        };
        assert!(partial.verify(&actual, "data").is_ok());

        let wrong = ChecksumInfo {
            md5: "00000000000000000000000000000000".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            wrong.verify(&actual, "data"),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_collection() {
        let db = Arc::new(Database::in_memory().unwrap());
        let storage = ChecksumCollection::new(db);
        let info = ChecksumInfo::compute_bytes(b"x");

        assert!(storage.get("ab/cd/file.deb").unwrap().is_none());
        storage.update("ab/cd/file.deb", &info).unwrap();
        assert_eq!(storage.get("ab/cd/file.deb").unwrap(), Some(info));
        storage.delete("ab/cd/file.deb").unwrap();
        assert!(storage.get("ab/cd/file.deb").unwrap().is_none());
    }
}
