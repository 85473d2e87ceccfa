// src/repository/remote.rs

//! Remote repositories (mirrors) of Debian archives
//!
//! A mirror update fetches `InRelease` (or `Release` plus `Release.gpg`),
//! verifies it, downloads the `Packages` index of every component and
//! architecture, checks each index against the Release checksums and then
//! downloads the package files that are not already in the pool. Downloads
//! run on a bounded rayon pool. Nothing is retried: a failed update leaves
//! the previous ref list in place.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::packages::{Package, PackageCollection, PackageRefList};
use crate::pool::{ChecksumInfo, ChecksumStorage, PackagePool};
use crate::repository::download::Downloader;
use crate::repository::parsers::debian::{
    ReleaseFile, decompress_index, packages_index_candidates, parse_packages, parse_release,
};
use crate::signer::{Verifier, strip_clearsign};
use crate::task::{Cancellation, Progress};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRepo {
    pub uuid: String,
    pub name: String,
    /// Archive root URL, always ending in `/`
    pub archive_root: String,
    pub distribution: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub last_download_date: Option<DateTime<Utc>>,
    /// Selected fields of the last downloaded Release file
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(skip)]
    ref_list: Option<PackageRefList>,
}

impl RemoteRepo {
    pub fn new(
        name: &str,
        archive_root: &str,
        distribution: &str,
        components: Vec<String>,
        architectures: Vec<String>,
    ) -> Result<Self> {
        super::validate_name(name)?;
        let scheme_ok = ["http://", "https://", "file://"]
            .iter()
            .any(|scheme| archive_root.starts_with(scheme));
        if !scheme_ok {
            return Err(Error::Validation(format!(
                "unsupported archive URL: {}",
                archive_root
            )));
        }
        if distribution.is_empty() || distribution.starts_with('/') {
            return Err(Error::Validation(format!(
                "invalid distribution: {:?}",
                distribution
            )));
        }

        let mut archive_root = archive_root.to_string();
        if !archive_root.ends_with('/') {
            archive_root.push('/');
        }

        Ok(Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            archive_root,
            distribution: distribution.to_string(),
            components,
            architectures,
            last_download_date: None,
            meta: BTreeMap::new(),
            ref_list: Some(PackageRefList::new()),
        })
    }

    pub fn key(&self) -> Vec<u8> {
        format!("R{}", self.uuid).into_bytes()
    }

    pub fn ref_key(&self) -> Vec<u8> {
        format!("E{}", self.uuid).into_bytes()
    }

    pub fn resource_key(&self) -> String {
        format!("R{}", self.uuid)
    }

    /// URL of a file under `dists/<distribution>/`
    pub fn release_url(&self, name: &str) -> String {
        format!("{}dists/{}/{}", self.archive_root, self.distribution, name)
    }

    /// URL of a package file given its `Filename` field
    pub fn package_url(&self, download_path: &str) -> String {
        format!("{}{}", self.archive_root, download_path.trim_start_matches('/'))
    }

    pub fn ref_list(&self) -> Option<&PackageRefList> {
        self.ref_list.as_ref()
    }

    pub fn loaded_refs(&self) -> Result<&PackageRefList> {
        self.ref_list
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("mirror {} is not loaded", self.name)))
    }

    pub fn update_ref_list(&mut self, list: PackageRefList) {
        self.ref_list = Some(list);
    }

    pub fn num_packages(&self) -> usize {
        self.ref_list.as_ref().map_or(0, PackageRefList::len)
    }
}

pub struct RemoteRepoCollection {
    db: Arc<Database>,
}

impl RemoteRepoCollection {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn add(&self, repo: &RemoteRepo) -> Result<()> {
        if self.by_name(&repo.name).is_ok() {
            return Err(Error::Conflict(format!(
                "mirror with name {} already exists",
                repo.name
            )));
        }
        self.update(repo)
    }

    pub fn update(&self, repo: &RemoteRepo) -> Result<()> {
        let mut batch = self.db.create_batch();
        batch.put_value(repo.key(), repo)?;
        if let Some(list) = &repo.ref_list {
            batch.put_value(repo.ref_key(), list)?;
        }
        self.db.write(batch)
    }

    pub fn load_complete(&self, repo: &mut RemoteRepo) -> Result<()> {
        let list = self
            .db
            .get_value::<PackageRefList>(&repo.ref_key())?
            .unwrap_or_default();
        repo.ref_list = Some(list);
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<RemoteRepo>> {
        let mut repos: Vec<RemoteRepo> = self.db.fetch_values(b"R")?;
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repos)
    }

    pub fn by_name(&self, name: &str) -> Result<RemoteRepo> {
        self.list()?
            .into_iter()
            .find(|repo| repo.name == name)
            .ok_or_else(|| Error::NotFound(format!("mirror with name {} not found", name)))
    }

    pub fn by_uuid(&self, uuid: &str) -> Result<RemoteRepo> {
        self.db
            .get_value(format!("R{}", uuid).as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("mirror with uuid {} not found", uuid)))
    }

    pub fn drop(&self, repo: &RemoteRepo) -> Result<()> {
        let mut batch = self.db.create_batch();
        batch.delete(repo.key());
        batch.delete(repo.ref_key());
        self.db.write(batch)
    }
}

/// Summary of one mirror update
#[derive(Debug, Default, Clone, Serialize)]
pub struct UpdateResult {
    pub packages: usize,
    pub downloaded: usize,
    pub bytes_downloaded: u64,
}

/// Everything a mirror update needs besides the mirror itself
pub struct MirrorUpdate<'a> {
    pub db: &'a Database,
    pub downloader: &'a dyn Downloader,
    /// `None` skips signature verification of the Release file
    pub verifier: Option<&'a dyn Verifier>,
    pub pool: &'a PackagePool,
    pub checksums: &'a dyn ChecksumStorage,
    pub packages: &'a PackageCollection,
    pub download_concurrency: usize,
    pub cancel: &'a Cancellation,
}

impl MirrorUpdate<'_> {
    /// Refresh `repo` from its archive; the caller persists the result
    pub fn run(&self, repo: &mut RemoteRepo, progress: &dyn Progress) -> Result<UpdateResult> {
        progress.colored_printf(format_args!(
            "Downloading & parsing package files for {}...",
            repo.name
        ));
        let release = self.fetch_release(repo)?;
        let architectures = select(&repo.architectures, &release.architectures, "architecture")?;
        let components = select(&repo.components, &release.components, "component")?;
        if architectures.is_empty() || components.is_empty() {
            return Err(Error::Validation(format!(
                "mirror {} has no components or architectures to download",
                repo.name
            )));
        }

        let mut packages: BTreeMap<_, Package> = BTreeMap::new();
        for component in &components {
            for architecture in &architectures {
                self.cancel.check("mirror update")?;
                for package in self.fetch_index(repo, &release, component, architecture)? {
                    packages.insert(package.reference(), package);
                }
            }
        }
        info!("Mirror {} lists {} packages", repo.name, packages.len());

        let mut packages: Vec<Package> = packages.into_values().collect();
        let mut pending = Vec::new();
        for (index, package) in packages.iter_mut().enumerate() {
            if package.files.is_empty() {
                return Err(Error::Internal(format!(
                    "package {} has no files",
                    package.short_key()
                )));
            }
            let file = &mut package.files[0];
            if file.checksums.sha256.is_empty() {
                pending.push(index);
                continue;
            }
            let relative = self.pool.relative_path(&file.filename, &file.checksums)?;
            if self.pool.verify(&relative, &file.checksums, self.checksums)? {
                file.pool_path = relative;
            } else {
                pending.push(index);
            }
        }

        progress.colored_printf(format_args!(
            "Download queue: {} items",
            pending.len()
        ));
        let (pool_paths, bytes_downloaded) = self.download_files(repo, &packages, &pending, progress)?;
        for (index, pool_path, checksums) in pool_paths {
            let file = &mut packages[index].files[0];
            file.pool_path = pool_path;
            file.checksums = checksums;
        }

        let mut batch = self.db.create_batch();
        for package in &packages {
            self.packages.update_in_batch(&mut batch, package)?;
        }
        self.db.write(batch)?;

        repo.update_ref_list(PackageRefList::from_packages(&packages));
        repo.last_download_date = Some(Utc::now());
        for field in ["Origin", "Label", "Suite", "Codename", "Date"] {
            if let Some(value) = release.stanza.get(field) {
                repo.meta.insert(field.to_string(), value.to_string());
            }
        }

        progress.colored_printf(format_args!(
            "@g[+]@| Mirror {} updated: {} packages",
            repo.name,
            packages.len()
        ));
        Ok(UpdateResult {
            packages: packages.len(),
            downloaded: pending.len(),
            bytes_downloaded,
        })
    }

    fn fetch_release(&self, repo: &RemoteRepo) -> Result<ReleaseFile> {
        let text = match self.downloader.get_bytes(&repo.release_url("InRelease")) {
            Ok(data) => match self.verifier {
                Some(verifier) => {
                    String::from_utf8(verifier.verify_clearsigned(&data)?).map_err(|e| {
                        Error::ParseError(format!("InRelease is not UTF-8: {}", e))
                    })?
                }
                None => strip_clearsign(&String::from_utf8_lossy(&data))?,
            },
            Err(Error::NotFound(_)) => {
                debug!("No InRelease for {}, falling back to Release", repo.name);
                let data = self.downloader.get_bytes(&repo.release_url("Release"))?;
                if let Some(verifier) = self.verifier {
                    let signature = self.downloader.get_bytes(&repo.release_url("Release.gpg"))?;
                    verifier.verify_detached_signature(&signature, &data)?;
                }
                String::from_utf8(data)
                    .map_err(|e| Error::ParseError(format!("Release is not UTF-8: {}", e)))?
            }
            Err(e) => return Err(e),
        };
        parse_release(&text)
    }

    fn fetch_index(
        &self,
        repo: &RemoteRepo,
        release: &ReleaseFile,
        component: &str,
        architecture: &str,
    ) -> Result<Vec<Package>> {
        let candidates = packages_index_candidates(component, architecture);
        let listed = candidates
            .iter()
            .find(|path| release.file(path).is_some())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no Packages index for {}/{} in Release of {}",
                    component, architecture, repo.name
                ))
            })?;

        let url = repo.release_url(listed);
        let data = self.downloader.get_bytes(&url)?;
        if let Some(expected) = release.file(listed) {
            expected.verify(&ChecksumInfo::compute_bytes(&data), &url)?;
        }
        parse_packages(&decompress_index(listed, &data)?)
    }

    /// Download the files of `packages[pending]` into the pool
    #[allow(clippy::type_complexity)]
    fn download_files(
        &self,
        repo: &RemoteRepo,
        packages: &[Package],
        pending: &[usize],
        progress: &dyn Progress,
    ) -> Result<(Vec<(usize, String, ChecksumInfo)>, u64)> {
        if pending.is_empty() {
            return Ok((Vec::new(), 0));
        }

        fs::create_dir_all(self.pool.root())?;
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(self.pool.root())?;
        let bytes = AtomicU64::new(0);

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(self.download_concurrency.max(1))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to start download workers: {}", e)))?;

        let results = workers.install(|| {
            pending
                .par_iter()
                .map(|&index| {
                    let file = &packages[index].files[0];
                    let temp = staging.path().join(format!("{}-{}", index, file.filename));
                    self.downloader.download(
                        &repo.package_url(&file.download_path),
                        &temp,
                        self.cancel,
                    )?;

                    let mut checksums = file.checksums.clone();
                    let pool_path =
                        self.pool
                            .import(&temp, &file.filename, &mut checksums, false, self.checksums)?;
                    fs::remove_file(&temp)?;
                    bytes.fetch_add(checksums.size, Ordering::Relaxed);
                    progress.colored_printf(format_args!("Downloaded {}", file.filename));
                    Ok((index, pool_path, checksums))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        Ok((results, bytes.load(Ordering::Relaxed)))
    }
}

/// Requested values, or everything the Release offers when none were given
fn select(requested: &[String], available: &[String], what: &str) -> Result<Vec<String>> {
    let available: Vec<String> = available
        .iter()
        .filter(|value| value.as_str() != "source")
        .cloned()
        .collect();
    if requested.is_empty() {
        return Ok(available);
    }
    if !available.is_empty() {
        if let Some(missing) = requested.iter().find(|value| !available.contains(value)) {
            return Err(Error::Validation(format!(
                "{} {} not available in repository, found: {}",
                what,
                missing,
                available.join(", ")
            )));
        }
    }
    Ok(requested.to_vec())
}
