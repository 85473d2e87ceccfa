// src/pool/package_pool.rs

//! Content-addressed package pool
//!
//! Files live at `<root>/<sha256[0:2]>/<sha256[2:4]>/<sha256[4:32]>_<basename>`.
//! The pool keeps no reference counts: callers prove a file is unreferenced
//! (through ref-list algebra) before calling [`PackagePool::remove`].

use crate::error::{Error, Result};
use crate::pool::checksum::{ChecksumInfo, ChecksumStorage};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub struct PackagePool {
    root: PathBuf,
}

impl PackagePool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pool-relative path for a file with the given checksums
    pub fn relative_path(&self, basename: &str, checksums: &ChecksumInfo) -> Result<String> {
        if basename.is_empty() || basename.contains('/') || basename == "." || basename == ".." {
            return Err(Error::Validation(format!("invalid file name: {:?}", basename)));
        }
        let sha = &checksums.sha256;
        if sha.len() < 32 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!(
                "unable to place {} in pool: SHA256 checksum missing",
                basename
            )));
        }
        Ok(format!("{}/{}/{}_{}", &sha[0..2], &sha[2..4], &sha[4..32], basename))
    }

    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Import `source` as `basename`, returning its pool-relative path
    ///
    /// Known digests in `checksums` are verified against the file and the
    /// rest are filled in. Importing the same content again returns the same
    /// path without touching the file. An existing file with other content
    /// at that path is only replaced when `force_overwrite` is set.
    pub fn import(
        &self,
        source: &Path,
        basename: &str,
        checksums: &mut ChecksumInfo,
        force_overwrite: bool,
        storage: &dyn ChecksumStorage,
    ) -> Result<String> {
        let actual = ChecksumInfo::compute(source)?;
        checksums.verify(&actual, &source.display().to_string())?;
        *checksums = actual;

        let relative = self.relative_path(basename, checksums)?;
        let target = self.full_path(&relative);

        if self.matches_existing(&relative, &target, checksums, storage)? {
            debug!("{} already in pool", relative);
            storage.update(&relative, checksums)?;
            return Ok(relative);
        }

        if target.exists() {
            if !force_overwrite {
                return Err(Error::Conflict(format!(
                    "pool file {} already exists with different content",
                    relative
                )));
            }
            warn!("Replacing pool file {} with different content", relative);
            fs::remove_file(&target)?;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::hard_link(source, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Imported concurrently by someone else
                if !self.matches_existing(&relative, &target, checksums, storage)? {
                    return Err(Error::Conflict(format!(
                        "pool file {} appeared with different content",
                        relative
                    )));
                }
            }
            Err(e) => {
                debug!("Hard link into pool failed ({}), copying instead", e);
                self.copy_into(source, &target)?;
            }
        }

        storage.update(&relative, checksums)?;
        info!("Imported {} into pool as {}", basename, relative);
        Ok(relative)
    }

    /// Copy through a temporary file so readers never see a partial file
    fn copy_into(&self, source: &Path, target: &Path) -> Result<()> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::Internal(format!("{} has no parent", target.display())))?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        io::copy(&mut File::open(source)?, temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        temp.persist(target).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn matches_existing(
        &self,
        relative: &str,
        target: &Path,
        checksums: &ChecksumInfo,
        storage: &dyn ChecksumStorage,
    ) -> Result<bool> {
        let metadata = match fs::metadata(target) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() != checksums.size {
            return Ok(false);
        }

        let known = match storage.get(relative)? {
            Some(known) if known.size == checksums.size => known,
            _ => ChecksumInfo::compute(target)?,
        };
        Ok(known.sha256 == checksums.sha256)
    }

    /// Delete a pool file, returning the number of bytes freed
    pub fn remove(&self, relative: &str) -> Result<u64> {
        let target = self.full_path(relative);
        let size = fs::metadata(&target)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    Error::NotFound(format!("pool file {} not found", relative))
                }
                _ => Error::Io(e),
            })?
            .len();
        fs::remove_file(&target)?;
        debug!("Removed pool file {} ({} bytes)", relative, size);

        // Prune empty hash directories; failure just means they are in use
        let mut dir = target.parent();
        while let Some(current) = dir {
            if current == self.root || fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }

        Ok(size)
    }

    /// Every file in the pool, relative to the root, sorted
    pub fn filepath_list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| Error::Internal(e.to_string()))?;
            paths.push(relative.to_string_lossy().replace('\\', "/"));
        }
        paths.sort();
        Ok(paths)
    }

    pub fn size(&self, relative: &str) -> Result<u64> {
        Ok(fs::metadata(self.full_path(relative))?.len())
    }

    pub fn open(&self, relative: &str) -> Result<File> {
        File::open(self.full_path(relative)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(format!("pool file {} not found", relative)),
            _ => Error::Io(e),
        })
    }

    /// Whether the file is present with the expected size
    ///
    /// Full digests are cached in `storage` the first time a file is
    /// verified, so later verifications only stat the file.
    pub fn verify(
        &self,
        relative: &str,
        checksums: &ChecksumInfo,
        storage: &dyn ChecksumStorage,
    ) -> Result<bool> {
        let target = self.full_path(relative);
        let size = match fs::metadata(&target) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if size != checksums.size {
            return Ok(false);
        }

        if storage.get(relative)?.is_none() {
            let actual = ChecksumInfo::compute(&target)?;
            if checksums.verify(&actual, relative).is_err() {
                return Ok(false);
            }
            storage.update(relative, &actual)?;
        }
        Ok(true)
    }
}
