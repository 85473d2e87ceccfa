// src/pool/storage.rs

//! Published storage: the public directory trees served to apt clients

use crate::error::{Error, Result};
use crate::pool::checksum::ChecksumInfo;
use crate::pool::package_pool::PackagePool;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// How pool files are placed into the public tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMethod {
    #[default]
    Hardlink,
    Copy,
    Symlink,
}

/// What [`PublishedStorage::link_from_pool`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// An identical file was already in place
    Unchanged,
    Created,
    /// A different file was moved aside to `backup`, relative to the root
    Replaced { backup: String },
}

/// Operations the publish pipeline needs from a public tree
///
/// Paths are relative to the storage root and use `/` separators.
pub trait PublishedStorage: Send + Sync {
    fn public_path(&self) -> &Path;

    fn mkdir(&self, path: &str) -> Result<()>;

    /// Copy a generated file into place
    fn put_file(&self, path: &str, source: &Path) -> Result<()>;

    fn remove(&self, path: &str) -> Result<()>;

    /// Move a file, replacing `to` if it exists
    fn rename_file(&self, from: &str, to: &str) -> Result<()>;

    /// Remove a directory tree; missing directories are fine
    fn remove_dirs(&self, path: &str) -> Result<()>;

    /// Place a pool file at `<directory>/<file_name>`
    ///
    /// A different file already there is a conflict unless `force` is set,
    /// in which case it is kept under a backup name until the caller either
    /// removes the backup or renames it back.
    fn link_from_pool(
        &self,
        directory: &str,
        file_name: &str,
        pool: &PackagePool,
        pool_path: &str,
        checksums: &ChecksumInfo,
        force: bool,
    ) -> Result<LinkOutcome>;

    /// Files under `prefix`, relative to it
    fn filelist(&self, prefix: &str) -> Result<Vec<String>>;

    fn file_exists(&self, path: &str) -> Result<bool>;

    /// Replace directory `path` with the staged directory in one rename
    fn swap_directory(&self, staged: &Path, path: &str) -> Result<()>;
}

/// Public tree on the local filesystem
pub struct LocalPublishedStorage {
    root: PathBuf,
    link_method: LinkMethod,
}

impl LocalPublishedStorage {
    pub fn new(root: impl Into<PathBuf>, link_method: LinkMethod) -> Self {
        Self {
            root: root.into(),
            link_method,
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::Validation(format!("invalid published path: {}", path)));
        }
        Ok(self.root.join(relative))
    }

    fn same_file(&self, existing: &Path, source: &Path, checksums: &ChecksumInfo) -> Result<bool> {
        let metadata = fs::metadata(existing)?;
        if metadata.len() != checksums.size {
            return Ok(false);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let source_meta = fs::metadata(source)?;
            if metadata.dev() == source_meta.dev() && metadata.ino() == source_meta.ino() {
                return Ok(true);
            }
        }
        #[cfg(not(unix))]
        let _ = source;

        Ok(ChecksumInfo::compute(existing)?.sha256 == checksums.sha256)
    }

    fn place(&self, source: &Path, target: &Path) -> Result<()> {
        match self.link_method {
            LinkMethod::Hardlink => match fs::hard_link(source, target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e.into()),
                Err(e) => {
                    debug!("Hard link failed ({}), copying {}", e, source.display());
                    fs::copy(source, target)?;
                    Ok(())
                }
            },
            LinkMethod::Copy => {
                fs::copy(source, target)?;
                Ok(())
            }
            LinkMethod::Symlink => {
                #[cfg(unix)]
                {
                    std::os::unix::fs::symlink(source, target)?;
                    Ok(())
                }
                #[cfg(not(unix))]
                {
                    fs::copy(source, target)?;
                    Ok(())
                }
            }
        }
    }
}

impl PublishedStorage for LocalPublishedStorage {
    fn public_path(&self) -> &Path {
        &self.root
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(path)?)?;
        Ok(())
    }

    fn put_file(&self, path: &str, source: &Path) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, target)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)?;
        Ok(())
    }

    fn remove_dirs(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match fs::remove_dir_all(&target) {
            Ok(()) => {
                debug!("Removed {}", target.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn link_from_pool(
        &self,
        directory: &str,
        file_name: &str,
        pool: &PackagePool,
        pool_path: &str,
        checksums: &ChecksumInfo,
        force: bool,
    ) -> Result<LinkOutcome> {
        let source = pool.full_path(pool_path);
        if !source.is_file() {
            return Err(Error::Internal(format!(
                "package file {} is missing from the pool ({})",
                file_name, pool_path
            )));
        }

        let dir = self.resolve(directory)?;
        fs::create_dir_all(&dir)?;
        let target = dir.join(file_name);

        let mut backup = None;
        if target.exists() {
            if self.same_file(&target, &source, checksums)? {
                return Ok(LinkOutcome::Unchanged);
            }
            if !force {
                return Err(Error::Conflict(format!(
                    "unable to link {}/{}: file already exists and is different",
                    directory, file_name
                )));
            }
            let name = format!(".{}.old-{}", file_name, uuid::Uuid::new_v4().simple());
            warn!("Overwriting {}/{}", directory, file_name);
            fs::rename(&target, dir.join(&name))?;
            backup = Some(name);
        }

        match self.place(&source, &target) {
            Ok(()) => Ok(match backup {
                Some(name) => LinkOutcome::Replaced {
                    backup: format!("{}/{}", directory, name),
                },
                None => LinkOutcome::Created,
            }),
            Err(e) => {
                if let Some(name) = backup {
                    fs::rename(dir.join(name), &target)?;
                    return Err(e);
                }
                match e {
                    // Linked concurrently by a publish sharing this prefix
                    Error::Io(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                        if self.same_file(&target, &source, checksums)? {
                            Ok(LinkOutcome::Unchanged)
                        } else {
                            Err(Error::Conflict(format!(
                                "unable to link {}/{}: file already exists and is different",
                                directory, file_name
                            )))
                        }
                    }
                    e => Err(e),
                }
            }
        }
    }

    fn filelist(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.resolve(prefix)?;
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&base).min_depth(1) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_dir() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&base)
                .map_err(|e| Error::Internal(e.to_string()))?;
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
        files.sort();
        Ok(files)
    }

    fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.exists())
    }

    fn swap_directory(&self, staged: &Path, path: &str) -> Result<()> {
        swap_into(staged, &self.resolve(path)?, |retired| fs::remove_dir_all(retired))
    }
}

/// Move `staged` to `target`, retiring the previous tree first
///
/// Once the new tree is in place the swap has succeeded; failing to
/// `discard` the retired tree only leaves it behind.
fn swap_into(
    staged: &Path,
    target: &Path,
    discard: impl FnOnce(&Path) -> io::Result<()>,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    if !target.exists() {
        fs::rename(staged, target)?;
        return Ok(());
    }

    let retired = target.with_extension(format!("old-{}", uuid::Uuid::new_v4().simple()));
    fs::rename(target, &retired)?;
    if let Err(e) = fs::rename(staged, target) {
        fs::rename(&retired, target)?;
        return Err(e.into());
    }
    if let Err(e) = discard(&retired) {
        warn!("Unable to remove retired tree {}: {}", retired.display(), e);
    }
    Ok(())
}

/// Named published storages; the empty name is the default public directory
pub struct StorageProvider {
    storages: HashMap<String, Arc<dyn PublishedStorage>>,
}

impl StorageProvider {
    pub fn new(default: Arc<dyn PublishedStorage>) -> Self {
        let mut storages = HashMap::new();
        storages.insert(String::new(), default);
        Self { storages }
    }

    /// Register a filesystem endpoint, addressed as `filesystem:<name>`
    pub fn add_filesystem(&mut self, name: &str, storage: Arc<dyn PublishedStorage>) {
        self.storages.insert(format!("filesystem:{}", name), storage);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn PublishedStorage>> {
        self.storages
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("published storage {} not configured", name)))
    }
}
