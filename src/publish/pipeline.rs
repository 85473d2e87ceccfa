// src/publish/pipeline.rs

//! Publish, update and drop of published repositories
//!
//! Publishing resolves each component to its source ref list, links the
//! package files into `<prefix>/pool/<component>/`, generates the
//! distribution tree in a staging directory, signs it and swaps it into
//! `<prefix>/dists/<distribution>` in one rename. Links created by a
//! publish that fails before the swap are removed again and files replaced
//! with `force_overwrite` are moved back, so the previously published state
//! stays untouched.
//!
//! Prefix cleanup runs after the new state is persisted and computes the
//! files still in use from every repo stored under the same prefix at that
//! moment. Callers serialize all operations on a prefix through its
//! resource key ([`prefix_resource_key`]).
//!
//! [`prefix_resource_key`]: crate::publish::prefix_resource_key

use crate::error::{Error, Result};
use crate::packages::{Package, PackageRefList, deb};
use crate::pool::{LinkOutcome, PackagePool, PublishedStorage, StorageProvider};
use crate::publish::index::IndexFiles;
use crate::publish::published::{PublishedRepo, SourceKind};
use crate::repository::CollectionFactory;
use crate::signer::Signer;
use crate::task::Progress;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use tracing::{debug, info, warn};

/// Knobs of a publish or update
#[derive(Default)]
pub struct PublishOptions<'a> {
    /// Replace files in the public pool that differ from the package pool
    pub force_overwrite: bool,
    pub skip_contents: bool,
    pub skip_cleanup: bool,
    /// `None` publishes unsigned
    pub signer: Option<&'a dyn Signer>,
}

/// Outcome of a publish, update or drop
#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub repo: String,
    /// Package files newly linked into the public pool
    pub linked: usize,
    /// Stale files removed by prefix cleanup
    pub removed_files: usize,
    /// Set when cleanup failed; the publish itself succeeded
    pub cleanup_error: Option<String>,
}

/// Public pool changes of one publish, undone if it fails before the swap
#[derive(Default)]
struct Links {
    created: Vec<String>,
    /// `(path, backup)` of files replaced with `force_overwrite`
    replaced: Vec<(String, String)>,
}

impl Links {
    fn count(&self) -> usize {
        self.created.len() + self.replaced.len()
    }
}

pub struct Publisher<'a> {
    pub factory: &'a CollectionFactory,
    pub pool: &'a PackagePool,
    pub storages: &'a StorageProvider,
}

impl Publisher<'_> {
    /// Publish a new repo; fails if its storage/prefix/distribution is taken
    pub fn publish(
        &self,
        mut repo: PublishedRepo,
        options: &PublishOptions<'_>,
        progress: &dyn Progress,
    ) -> Result<PublishReport> {
        let existing = self.factory.published_repos().by_storage_prefix_distribution(
            &repo.storage,
            &repo.prefix,
            &repo.distribution,
        );
        match existing {
            Ok(_) => {
                return Err(Error::Conflict(format!(
                    "prefix/distribution already used by another published repo: {}",
                    repo
                )));
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        repo.skip_contents = options.skip_contents;
        self.run(repo, options, true, progress)
    }

    /// Re-publish a repo, optionally switching components to other snapshots
    ///
    /// `switch` maps component names to snapshot names.
    pub fn update(
        &self,
        storage: &str,
        prefix: &str,
        distribution: &str,
        switch: &BTreeMap<String, String>,
        options: &PublishOptions<'_>,
        progress: &dyn Progress,
    ) -> Result<PublishReport> {
        let mut repo = self
            .factory
            .published_repos()
            .by_storage_prefix_distribution(storage, prefix, distribution)?;

        if !switch.is_empty() {
            if repo.source_kind != SourceKind::Snapshot {
                return Err(Error::Validation(format!(
                    "published repo {} is not published from snapshots, switch is not possible",
                    repo
                )));
            }
            let snapshots = self.factory.snapshots();
            for (component, name) in switch {
                if !repo.sources.contains_key(component) {
                    return Err(Error::NotFound(format!(
                        "component {} does not exist in published repo {}",
                        component, repo
                    )));
                }
                let snapshot = snapshots.by_name(name)?;
                repo.sources.insert(component.clone(), snapshot.uuid);
            }
        }

        self.run(repo, options, false, progress)
    }

    /// Remove a published distribution and clean its prefix
    pub fn drop(
        &self,
        storage: &str,
        prefix: &str,
        distribution: &str,
        skip_cleanup: bool,
        progress: &dyn Progress,
    ) -> Result<PublishReport> {
        let repo = self
            .factory
            .published_repos()
            .by_storage_prefix_distribution(storage, prefix, distribution)?;
        let public = self.storages.get(&repo.storage)?;

        progress.colored_printf(format_args!("Removing {}...", repo.dists_path()));
        public.remove_dirs(&repo.dists_path())?;
        self.factory.published_repos().remove(&repo)?;
        info!("Dropped published repo {}", repo);

        let components: Vec<String> = repo.sources.keys().cloned().collect();
        let (removed_files, cleanup_error) = if skip_cleanup {
            (0, None)
        } else {
            self.report_cleanup(&*public, &repo, &components, progress)
        };

        Ok(PublishReport {
            repo: repo.to_string(),
            linked: 0,
            removed_files,
            cleanup_error,
        })
    }

    fn run(
        &self,
        mut repo: PublishedRepo,
        options: &PublishOptions<'_>,
        is_new: bool,
        progress: &dyn Progress,
    ) -> Result<PublishReport> {
        let public = self.storages.get(&repo.storage)?;

        progress.colored_printf(format_args!("Loading packages..."));
        let refs = self.resolve_sources(&repo)?;
        let collection = self.factory.packages();
        let mut packages: BTreeMap<String, Vec<Package>> = BTreeMap::new();
        for (component, list) in &refs {
            packages.insert(component.clone(), collection.by_refs(list)?);
        }
        let architectures = publish_architectures(&repo, &packages)?;

        progress.colored_printf(format_args!(
            "Generating metadata files and linking package files..."
        ));
        let mut links = Links::default();
        let staged = self
            .link_files(&*public, &repo, &packages, options.force_overwrite, &mut links)
            .and_then(|()| self.stage(&*public, &repo, &packages, &architectures, options, progress));
        let staging = match staged {
            Ok(staging) => staging,
            Err(e) => {
                self.rollback(&*public, &links);
                return Err(e);
            }
        };

        progress.colored_printf(format_args!("Finalizing metadata files..."));
        if let Err(e) = public.swap_directory(staging.path(), &repo.dists_path()) {
            self.rollback(&*public, &links);
            return Err(e);
        }
        for (path, backup) in &links.replaced {
            if let Err(e) = public.remove(backup) {
                warn!("Unable to remove {} replacing {}: {}", backup, path, e);
            }
        }

        repo.refs = refs;
        repo.last_published = Some(Utc::now());
        {
            let collection = self.factory.published_repos();
            if is_new {
                collection.add(&repo)?;
            } else {
                collection.update(&repo)?;
            }
        }
        info!(
            "Published {} ({} packages, {} new files)",
            repo,
            repo.num_packages(),
            links.count()
        );

        let components: Vec<String> = repo.sources.keys().cloned().collect();
        let (removed_files, cleanup_error) = if options.skip_cleanup {
            (0, None)
        } else {
            self.report_cleanup(&*public, &repo, &components, progress)
        };

        progress.colored_printf(format_args!(
            "@g[+]@| Published {} repository {} successfully",
            repo.source_kind, repo
        ));
        Ok(PublishReport {
            repo: repo.to_string(),
            linked: links.count(),
            removed_files,
            cleanup_error,
        })
    }

    fn resolve_sources(&self, repo: &PublishedRepo) -> Result<BTreeMap<String, PackageRefList>> {
        let mut refs = BTreeMap::new();
        match repo.source_kind {
            SourceKind::Local => {
                let locals = self.factory.local_repos();
                for (component, uuid) in &repo.sources {
                    let mut local = locals.by_uuid(uuid)?;
                    locals.load_complete(&mut local)?;
                    refs.insert(component.clone(), local.loaded_refs()?.clone());
                }
            }
            SourceKind::Snapshot => {
                let snapshots = self.factory.snapshots();
                for (component, uuid) in &repo.sources {
                    let mut snapshot = snapshots.by_uuid(uuid)?;
                    snapshots.load_complete(&mut snapshot)?;
                    refs.insert(component.clone(), snapshot.loaded_refs()?.clone());
                }
            }
        }
        Ok(refs)
    }

    /// Link every package file into the public pool, recording new links
    fn link_files(
        &self,
        public: &dyn PublishedStorage,
        repo: &PublishedRepo,
        packages: &BTreeMap<String, Vec<Package>>,
        force: bool,
        links: &mut Links,
    ) -> Result<()> {
        for (component, list) in packages {
            for package in list {
                let directory = format!("{}/{}", repo.pool_path(component), package.pool_directory()?);
                for file in &package.files {
                    if file.pool_path.is_empty() {
                        return Err(Error::Internal(format!(
                            "package {} was never imported into the pool",
                            package.short_key()
                        )));
                    }
                    let outcome = public.link_from_pool(
                        &directory,
                        &file.filename,
                        self.pool,
                        &file.pool_path,
                        &file.checksums,
                        force,
                    )?;
                    let path = format!("{}/{}", directory, file.filename);
                    match outcome {
                        LinkOutcome::Unchanged => {}
                        LinkOutcome::Created => links.created.push(path),
                        LinkOutcome::Replaced { backup } => links.replaced.push((path, backup)),
                    }
                }
            }
        }
        Ok(())
    }

    /// Generate and sign the distribution tree in a staging directory
    fn stage(
        &self,
        public: &dyn PublishedStorage,
        repo: &PublishedRepo,
        packages: &BTreeMap<String, Vec<Package>>,
        architectures: &[String],
        options: &PublishOptions<'_>,
        progress: &dyn Progress,
    ) -> Result<tempfile::TempDir> {
        let prefix_dir = public.public_path().join(repo.prefix_path());
        fs::create_dir_all(&prefix_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".publish-")
            .tempdir_in(&prefix_dir)?;

        let mut index = IndexFiles::new(staging.path());
        let with_contents = !(options.skip_contents || repo.skip_contents);
        for (component, list) in packages {
            for architecture in architectures {
                let matching: Vec<&Package> = list
                    .iter()
                    .filter(|p| p.matches_architecture(architecture))
                    .collect();
                index.write_packages_index(component, architecture, &matching)?;
                index.write_arch_release(repo, component, architecture)?;
                if with_contents {
                    let contents = self.contents(&matching)?;
                    index.write_contents(component, architecture, &contents)?;
                }
            }
        }
        index.write_release(repo, architectures, Utc::now())?;

        if let Some(signer) = options.signer {
            progress.colored_printf(format_args!("Signing file 'Release'..."));
            index.sign(signer)?;
        }
        Ok(staging)
    }

    fn contents(&self, packages: &[&Package]) -> Result<BTreeMap<String, Vec<String>>> {
        let mut contents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for package in packages {
            let section = package.stanza.get("Section").unwrap_or("misc");
            let owner = format!("{}/{}", section, package.name);
            for file in &package.files {
                let paths = deb::read_contents(&self.pool.full_path(&file.pool_path))?;
                for path in paths {
                    contents.entry(path).or_default().push(owner.clone());
                }
            }
        }
        Ok(contents)
    }

    fn rollback(&self, public: &dyn PublishedStorage, links: &Links) {
        for path in &links.created {
            if let Err(e) = public.remove(path) {
                warn!("Unable to remove {} after failed publish: {}", path, e);
            }
        }
        for (path, backup) in &links.replaced {
            if let Err(e) = public.rename_file(backup, path) {
                warn!("Unable to restore {} after failed publish: {}", path, e);
            }
        }
    }

    fn report_cleanup(
        &self,
        public: &dyn PublishedStorage,
        repo: &PublishedRepo,
        components: &[String],
        progress: &dyn Progress,
    ) -> (usize, Option<String>) {
        progress.colored_printf(format_args!(
            "Cleaning up prefix {:?} components {}...",
            repo.prefix,
            components.join(", ")
        ));
        match self.cleanup_prefix(public, repo, components) {
            Ok(removed) => (removed, None),
            Err(e) => {
                warn!("Cleanup of prefix {} failed: {}", repo.prefix, e);
                progress.colored_printf(format_args!("@y[!]@| @!Cleanup failed: {}@|", e));
                (0, Some(e.to_string()))
            }
        }
    }

    /// Remove files under `<prefix>/pool/<component>` that no repo stored
    /// under the prefix references any more
    pub fn cleanup_prefix(
        &self,
        public: &dyn PublishedStorage,
        repo: &PublishedRepo,
        components: &[String],
    ) -> Result<usize> {
        let repos = self
            .factory
            .published_repos()
            .by_prefix(&repo.storage, &repo.prefix)?;
        let collection = self.factory.packages();

        let mut removed = 0;
        for component in components {
            let mut referenced: HashSet<String> = HashSet::new();
            for other in &repos {
                let Some(list) = other.refs.get(component) else {
                    continue;
                };
                for package in collection.by_refs(list)? {
                    let directory = package.pool_directory()?;
                    for file in &package.files {
                        referenced.insert(format!("{}/{}", directory, file.filename));
                    }
                }
            }

            let pool_dir = repo.pool_path(component);
            for file in public.filelist(&pool_dir)? {
                if referenced.contains(&file) {
                    continue;
                }
                debug!("Removing unreferenced {}/{}", pool_dir, file);
                public.remove(&format!("{}/{}", pool_dir, file))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Explicit architectures, or every non-`all` architecture in the packages
fn publish_architectures(
    repo: &PublishedRepo,
    packages: &BTreeMap<String, Vec<Package>>,
) -> Result<Vec<String>> {
    if !repo.architectures.is_empty() {
        let mut architectures = repo.architectures.clone();
        architectures.sort();
        architectures.dedup();
        return Ok(architectures);
    }

    let derived: BTreeSet<&str> = packages
        .values()
        .flatten()
        .map(|p| p.architecture.as_str())
        .filter(|arch| *arch != "all")
        .collect();
    if derived.is_empty() {
        return Err(Error::Validation(
            "unable to figure out list of architectures, please supply explicit list".to_string(),
        ));
    }
    Ok(derived.into_iter().map(str::to_string).collect())
}
