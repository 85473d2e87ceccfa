// src/repository/local.rs

//! Local repositories: user-edited package sets

use crate::db::Database;
use crate::error::{Error, Result};
use crate::packages::{Package, PackageCollection, PackageFile, PackageRefList, deb};
use crate::pool::{ChecksumInfo, ChecksumStorage, PackagePool};
use crate::task::Progress;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRepo {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub default_distribution: String,
    #[serde(default)]
    pub default_component: String,
    #[serde(skip)]
    ref_list: Option<PackageRefList>,
}

impl LocalRepo {
    pub fn new(name: &str, comment: &str) -> Result<Self> {
        super::validate_name(name)?;
        Ok(Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            comment: comment.to_string(),
            default_distribution: String::new(),
            default_component: String::new(),
            ref_list: Some(PackageRefList::new()),
        })
    }

    pub fn key(&self) -> Vec<u8> {
        format!("L{}", self.uuid).into_bytes()
    }

    pub fn ref_key(&self) -> Vec<u8> {
        format!("E{}", self.uuid).into_bytes()
    }

    /// Scheduler resource key; carries the `L` tag of local repos
    pub fn resource_key(&self) -> String {
        format!("L{}", self.uuid)
    }

    /// Contents; `None` until loaded with [`LocalRepoCollection::load_complete`]
    pub fn ref_list(&self) -> Option<&PackageRefList> {
        self.ref_list.as_ref()
    }

    pub fn loaded_refs(&self) -> Result<&PackageRefList> {
        self.ref_list
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("local repo {} is not loaded", self.name)))
    }

    pub fn update_ref_list(&mut self, list: PackageRefList) {
        self.ref_list = Some(list);
    }

    pub fn num_packages(&self) -> usize {
        self.ref_list.as_ref().map_or(0, PackageRefList::len)
    }
}

pub struct LocalRepoCollection {
    db: Arc<Database>,
}

impl LocalRepoCollection {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a new repo; names are unique
    pub fn add(&self, repo: &LocalRepo) -> Result<()> {
        if self.by_name(&repo.name).is_ok() {
            return Err(Error::Conflict(format!(
                "local repo with name {} already exists",
                repo.name
            )));
        }
        self.update(repo)
    }

    /// Persist the repo and, if loaded, its ref list in one batch
    pub fn update(&self, repo: &LocalRepo) -> Result<()> {
        let mut batch = self.db.create_batch();
        batch.put_value(repo.key(), repo)?;
        if let Some(list) = &repo.ref_list {
            batch.put_value(repo.ref_key(), list)?;
        }
        self.db.write(batch)
    }

    /// Give the repo a new unique name
    pub fn rename(&self, repo: &mut LocalRepo, name: &str) -> Result<()> {
        super::validate_name(name)?;
        if name != repo.name && self.by_name(name).is_ok() {
            return Err(Error::Conflict(format!(
                "local repo with name {} already exists",
                name
            )));
        }
        repo.name = name.to_string();
        let mut batch = self.db.create_batch();
        batch.put_value(repo.key(), &*repo)?;
        self.db.write(batch)
    }

    pub fn load_complete(&self, repo: &mut LocalRepo) -> Result<()> {
        let list = self
            .db
            .get_value::<PackageRefList>(&repo.ref_key())?
            .unwrap_or_default();
        repo.ref_list = Some(list);
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<LocalRepo>> {
        let mut repos: Vec<LocalRepo> = self.db.fetch_values(b"L")?;
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repos)
    }

    pub fn by_name(&self, name: &str) -> Result<LocalRepo> {
        self.list()?
            .into_iter()
            .find(|repo| repo.name == name)
            .ok_or_else(|| Error::NotFound(format!("local repo with name {} not found", name)))
    }

    pub fn by_uuid(&self, uuid: &str) -> Result<LocalRepo> {
        self.db
            .get_value(format!("L{}", uuid).as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("local repo with uuid {} not found", uuid)))
    }

    pub fn drop(&self, repo: &LocalRepo) -> Result<()> {
        let mut batch = self.db.create_batch();
        batch.delete(repo.key());
        batch.delete(repo.ref_key());
        self.db.write(batch)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.db.keys_by_prefix(b"L")?.len())
    }
}

/// Outcome of adding package files to a repo
#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportResult {
    pub added: Vec<String>,
    pub failed: Vec<String>,
}

/// `.deb` files named directly or found under directories
pub fn collect_package_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(std::io::Error::from)?;
                if entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|ext| ext == "deb")
                {
                    files.push(entry.into_path());
                }
            }
        } else if path.exists() {
            files.push(path.clone());
        } else {
            return Err(Error::NotFound(format!("{} does not exist", path.display())));
        }
    }
    Ok(files)
}

fn import_one(
    path: &Path,
    pool: &PackagePool,
    checksum_storage: &dyn ChecksumStorage,
) -> Result<Package> {
    let stanza = deb::read_control(path)?;
    let mut package = Package::from_control(stanza)?;

    let basename = format!(
        "{}_{}_{}.deb",
        package.name,
        package.version.split_once(':').map_or(package.version.as_str(), |(_, v)| v),
        package.architecture
    );
    let mut checksums = ChecksumInfo::default();
    let pool_path = pool.import(path, &basename, &mut checksums, false, checksum_storage)?;

    let mut file = PackageFile::new(basename, checksums);
    file.pool_path = pool_path;
    package.files.push(file);
    Ok(package)
}

/// Import `.deb` files into the pool and add them to `list`
///
/// Unreadable files and packages conflicting with a different build of the
/// same name/version/architecture are reported in `failed`; a conflicting
/// package replaces the old one when `force_replace` is set.
pub fn import_packages(
    files: &[PathBuf],
    list: &mut PackageRefList,
    force_replace: bool,
    pool: &PackagePool,
    checksum_storage: &dyn ChecksumStorage,
    packages: &PackageCollection,
    progress: &dyn Progress,
) -> Result<ImportResult> {
    let mut result = ImportResult::default();

    for path in files {
        let package = match import_one(path, pool, checksum_storage) {
            Ok(package) => package,
            Err(e) => {
                warn!("Unable to import {}: {}", path.display(), e);
                progress.colored_printf(format_args!("@y[!]@| @!Unable to import {}: {}@|", path.display(), e));
                result.failed.push(format!("{}: {}", path.display(), e));
                continue;
            }
        };

        let reference = package.reference();
        if let Some(existing) = list.find_conflict(&reference).cloned() {
            if force_replace {
                list.remove(&existing);
            } else {
                progress.colored_printf(format_args!(
                    "@y[!]@| @!Conflict in package {}@|",
                    package.short_key()
                ));
                result.failed.push(format!(
                    "{}: conflict in package {}",
                    path.display(),
                    package.short_key()
                ));
                continue;
            }
        }

        packages.update(&package)?;
        list.add(reference);
        progress.colored_printf(format_args!("@g[+]@| {} added@|", package.short_key()));
        result.added.push(package.short_key());
    }

    info!(
        "Imported {} package(s), {} failed",
        result.added.len(),
        result.failed.len()
    );
    Ok(result)
}
