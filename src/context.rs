// src/context.rs

//! Wiring of configuration, store, pool and published storages
//!
//! [`Context`] carries every collaborator an operation needs and implements
//! the operations that span several collections. Each of those takes the
//! collection locks through [`CollectionFactory`] in its fixed order. The
//! task scheduler is owned by the caller so that a task holding the
//! context never owns the scheduler it runs on.

use crate::config::Config;
use crate::db;
use crate::error::{Error, Result};
use crate::packages::{Package, PackageDiff, PackageRef};
use crate::pool::{LocalPublishedStorage, PackagePool, StorageProvider};
use crate::publish::published::normalize_prefix;
use crate::publish::{
    PublishOptions, PublishReport, PublishedRepo, Publisher, SourceKind, prefix_resource_key,
};
use crate::repository::local::{collect_package_files, import_packages};
use crate::repository::remote::UpdateResult;
use crate::repository::snapshot;
use crate::repository::{
    CleanupReport, CollectionFactory, HttpDownloader, ImportResult, LocalRepo, MirrorUpdate,
    RemoteRepo, Snapshot, cleanup_database,
};
use crate::signer::{self, Signer, SigningOptions};
use crate::task::{ALL_LOCAL_REPOS_RESOURCES_KEY, Cancellation, Progress};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// What to publish and where
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub source_kind: Option<SourceKind>,
    /// Component name to local repo or snapshot name
    pub components: Vec<(String, String)>,
    /// Empty for the default public directory
    pub storage: String,
    pub prefix: String,
    pub distribution: String,
    pub architectures: Vec<String>,
    pub origin: String,
    pub label: String,
    pub force_overwrite: bool,
    pub skip_contents: bool,
    pub skip_cleanup: bool,
    /// `None` publishes unsigned
    pub signing: Option<SigningOptions>,
}

/// Fields of a local repo that can be changed after creation
#[derive(Debug, Clone, Default)]
pub struct LocalRepoEdit {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub default_distribution: Option<String>,
    pub default_component: Option<String>,
}

pub struct Context {
    config: Config,
    factory: CollectionFactory,
    pool: PackagePool,
    storages: StorageProvider,
    cancel: Cancellation,
}

impl Context {
    /// Open (or create) the database and directories named by `config`
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let database = db::open_or_init(&config.database_path())?;

        let pool = PackagePool::new(config.pool_dir());
        let mut storages = StorageProvider::new(Arc::new(LocalPublishedStorage::new(
            config.public_dir(),
            config.link_method,
        )));
        for (name, endpoint) in &config.filesystem_publish_endpoints {
            storages.add_filesystem(
                name,
                Arc::new(LocalPublishedStorage::new(
                    endpoint.root_dir.clone(),
                    endpoint.link_method,
                )),
            );
        }

        info!("Using root directory {}", config.root_dir.display());
        Ok(Self {
            config,
            factory: CollectionFactory::new(Arc::new(database)),
            pool,
            storages,
            cancel: Cancellation::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn factory(&self) -> &CollectionFactory {
        &self.factory
    }

    pub fn pool(&self) -> &PackagePool {
        &self.pool
    }

    pub fn storages(&self) -> &StorageProvider {
        &self.storages
    }

    /// Signal observed by long-running downloads
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    fn publisher(&self) -> Publisher<'_> {
        Publisher {
            factory: &self.factory,
            pool: &self.pool,
            storages: &self.storages,
        }
    }

    /// Signer for `options`, or `None` when signing is skipped or disabled
    pub fn signer(&self, options: Option<&SigningOptions>) -> Result<Option<Box<dyn Signer>>> {
        match options {
            Some(options) if !self.config.gpg_disable_sign => {
                Ok(Some(signer::new_signer(self.config.gpg_provider, options)?))
            }
            _ => Ok(None),
        }
    }

    // Local repos

    pub fn create_local_repo(
        &self,
        name: &str,
        comment: &str,
        default_distribution: &str,
        default_component: &str,
    ) -> Result<LocalRepo> {
        let mut repo = LocalRepo::new(name, comment)?;
        repo.default_distribution = default_distribution.to_string();
        repo.default_component = default_component.to_string();
        self.factory.local_repos().add(&repo)?;
        info!("Created local repo {}", repo.name);
        Ok(repo)
    }

    pub fn local_repo(&self, name: &str) -> Result<LocalRepo> {
        let collection = self.factory.local_repos();
        let mut repo = collection.by_name(name)?;
        collection.load_complete(&mut repo)?;
        Ok(repo)
    }

    pub fn edit_local_repo(&self, name: &str, edit: &LocalRepoEdit) -> Result<LocalRepo> {
        let collection = self.factory.local_repos();
        let mut repo = collection.by_name(name)?;
        if let Some(comment) = &edit.comment {
            repo.comment = comment.clone();
        }
        if let Some(distribution) = &edit.default_distribution {
            repo.default_distribution = distribution.clone();
        }
        if let Some(component) = &edit.default_component {
            repo.default_component = component.clone();
        }
        collection.update(&repo)?;
        if let Some(new_name) = &edit.name {
            collection.rename(&mut repo, new_name)?;
        }
        Ok(repo)
    }

    /// Drop a local repo that is not published
    ///
    /// Snapshots taken from the repo keep their contents; dropping it while
    /// they exist needs `force`.
    pub fn drop_local_repo(&self, name: &str, force: bool) -> Result<()> {
        let all = self.factory.lock_all();
        let repo = all.local.by_name(name)?;

        let published = all.published.by_local_repo(&repo.uuid)?;
        if let Some(first) = published.first() {
            return Err(Error::Conflict(format!(
                "unable to drop: local repo {} is published as {}",
                repo.name, first
            )));
        }
        let snapshots = all.snapshots.by_local_repo_source(&repo)?;
        if !force && !snapshots.is_empty() {
            let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
            return Err(Error::Conflict(format!(
                "local repo {} was used to create snapshots {}, use force to drop it anyway",
                repo.name,
                names.join(", ")
            )));
        }

        (*all.local).drop(&repo)?;
        info!("Dropped local repo {}", repo.name);
        Ok(())
    }

    /// Import `.deb` files (or directories of them) into a local repo
    pub fn add_packages(
        &self,
        repo_name: &str,
        paths: &[PathBuf],
        force_replace: bool,
        progress: &dyn Progress,
    ) -> Result<ImportResult> {
        let files = collect_package_files(paths)?;
        let collection = self.factory.local_repos();
        let mut repo = collection.by_name(repo_name)?;
        collection.load_complete(&mut repo)?;

        let mut list = repo.loaded_refs()?.clone();
        let result = import_packages(
            &files,
            &mut list,
            force_replace,
            &self.pool,
            &self.factory.checksums(),
            &self.factory.packages(),
            progress,
        )?;
        repo.update_ref_list(list);
        collection.update(&repo)?;
        Ok(result)
    }

    /// Remove packages given by ref from a local repo; returns what was removed
    pub fn remove_packages(
        &self,
        repo_name: &str,
        refs: &[String],
        progress: &dyn Progress,
    ) -> Result<Vec<PackageRef>> {
        let collection = self.factory.local_repos();
        let mut repo = collection.by_name(repo_name)?;
        collection.load_complete(&mut repo)?;

        let mut list = repo.loaded_refs()?.clone();
        let mut removed = Vec::new();
        for raw in refs {
            let reference = PackageRef::parse(raw)?;
            if !list.remove(&reference) {
                return Err(Error::NotFound(format!(
                    "package {} is not in local repo {}",
                    reference, repo.name
                )));
            }
            progress.colored_printf(format_args!("@r[-]@| {} removed", reference));
            removed.push(reference);
        }
        repo.update_ref_list(list);
        collection.update(&repo)?;
        Ok(removed)
    }

    /// Copy packages with the given names from one local repo to another
    pub fn copy_packages(
        &self,
        source: &str,
        destination: &str,
        names: &[String],
        progress: &dyn Progress,
    ) -> Result<Vec<PackageRef>> {
        let collection = self.factory.local_repos();
        let mut from = collection.by_name(source)?;
        collection.load_complete(&mut from)?;
        let mut to = collection.by_name(destination)?;
        collection.load_complete(&mut to)?;

        let packages = self.factory.packages();
        let mut list = to.loaded_refs()?.clone();
        let mut copied = Vec::new();
        for name in names {
            let matches = packages.search_by_name(from.loaded_refs()?, name);
            if matches.is_empty() {
                return Err(Error::NotFound(format!(
                    "package {} is not in local repo {}",
                    name, from.name
                )));
            }
            for reference in matches.iter() {
                if let Some(existing) = list.find_conflict(reference) {
                    return Err(Error::Conflict(format!(
                        "package {} conflicts with {} in local repo {}",
                        reference, existing, to.name
                    )));
                }
                if list.add(reference.clone()) {
                    progress.colored_printf(format_args!("@g[+]@| {} copied", reference));
                    copied.push(reference.clone());
                }
            }
        }
        to.update_ref_list(list);
        collection.update(&to)?;
        Ok(copied)
    }

    pub fn local_repo_packages(&self, name: &str) -> Result<Vec<Package>> {
        let repo = self.local_repo(name)?;
        self.factory.packages().by_refs(repo.loaded_refs()?)
    }

    // Mirrors

    pub fn create_mirror(
        &self,
        name: &str,
        archive_root: &str,
        distribution: &str,
        components: Vec<String>,
        architectures: Vec<String>,
    ) -> Result<RemoteRepo> {
        let architectures = if architectures.is_empty() {
            self.config.architectures.clone()
        } else {
            architectures
        };
        let repo = RemoteRepo::new(name, archive_root, distribution, components, architectures)?;
        self.factory.remote_repos().add(&repo)?;
        info!("Created mirror {} of {}", repo.name, repo.archive_root);
        Ok(repo)
    }

    /// Download the current state of a mirror and store it
    pub fn update_mirror(&self, name: &str, progress: &dyn Progress) -> Result<UpdateResult> {
        let mut repo = {
            let collection = self.factory.remote_repos();
            let mut repo = collection.by_name(name)?;
            collection.load_complete(&mut repo)?;
            repo
        };

        let downloader = HttpDownloader::new()?;
        let verifier = if self.config.gpg_disable_verify {
            None
        } else {
            Some(signer::new_verifier(
                self.config.gpg_provider,
                &self.config.gpg_keyrings,
            )?)
        };
        let packages = self.factory.packages();
        let checksums = self.factory.checksums();
        let update = MirrorUpdate {
            db: self.factory.db(),
            downloader: &downloader,
            verifier: verifier.as_deref(),
            pool: &self.pool,
            checksums: &checksums,
            packages: &packages,
            download_concurrency: self.config.download_concurrency,
            cancel: &self.cancel,
        };
        let result = update.run(&mut repo, progress)?;

        self.factory.remote_repos().update(&repo)?;
        Ok(result)
    }

    /// Drop a mirror; snapshots taken from it need `force`
    pub fn drop_mirror(&self, name: &str, force: bool) -> Result<()> {
        let all = self.factory.lock_all();
        let repo = all.remote.by_name(name)?;
        let snapshots = all.snapshots.by_remote_repo_source(&repo)?;
        if !force && !snapshots.is_empty() {
            let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
            return Err(Error::Conflict(format!(
                "mirror {} was used to create snapshots {}, use force to drop it anyway",
                repo.name,
                names.join(", ")
            )));
        }
        (*all.remote).drop(&repo)?;
        info!("Dropped mirror {}", repo.name);
        Ok(())
    }

    // Snapshots

    pub fn snapshot_local_repo(&self, name: &str, repo_name: &str) -> Result<Snapshot> {
        let repo = self.local_repo(repo_name)?;
        let snapshot = Snapshot::from_local_repo(name, &repo)?;
        self.factory.snapshots().add(&snapshot)?;
        info!("Created snapshot {} of local repo {}", name, repo_name);
        Ok(snapshot)
    }

    pub fn snapshot_mirror(&self, name: &str, mirror_name: &str) -> Result<Snapshot> {
        let repo = {
            let collection = self.factory.remote_repos();
            let mut repo = collection.by_name(mirror_name)?;
            collection.load_complete(&mut repo)?;
            repo
        };
        let snapshot = Snapshot::from_remote_repo(name, &repo)?;
        self.factory.snapshots().add(&snapshot)?;
        info!("Created snapshot {} of mirror {}", name, mirror_name);
        Ok(snapshot)
    }

    pub fn snapshot(&self, name: &str) -> Result<Snapshot> {
        let collection = self.factory.snapshots();
        let mut snapshot = collection.by_name(name)?;
        collection.load_complete(&mut snapshot)?;
        Ok(snapshot)
    }

    pub fn merge_snapshots(&self, name: &str, sources: &[String], latest: bool) -> Result<Snapshot> {
        let collection = self.factory.snapshots();
        let mut loaded = Vec::with_capacity(sources.len());
        for source in sources {
            let mut snapshot = collection.by_name(source)?;
            collection.load_complete(&mut snapshot)?;
            loaded.push(snapshot);
        }
        let merged = Snapshot::merge(name, &loaded, latest)?;
        collection.add(&merged)?;
        info!("Created snapshot {} by merging {}", name, sources.join(", "));
        Ok(merged)
    }

    pub fn diff_snapshots(
        &self,
        left: &str,
        right: &str,
        only_matching: bool,
    ) -> Result<Vec<PackageDiff>> {
        let left = self.snapshot(left)?;
        let right = self.snapshot(right)?;
        snapshot::diff(&left, &right, &self.factory.packages(), only_matching)
    }

    pub fn rename_snapshot(
        &self,
        name: &str,
        new_name: &str,
        description: Option<&str>,
    ) -> Result<Snapshot> {
        let collection = self.factory.snapshots();
        let mut snapshot = collection.by_name(name)?;
        collection.rename(&mut snapshot, new_name, description)?;
        Ok(snapshot)
    }

    /// Drop a snapshot that is not published
    ///
    /// Snapshots merged from it keep their contents; dropping it while they
    /// exist needs `force`.
    pub fn drop_snapshot(&self, name: &str, force: bool) -> Result<()> {
        let all = self.factory.lock_all();
        let snapshot = all.snapshots.by_name(name)?;

        let published = all.published.by_snapshot(&snapshot.uuid)?;
        if let Some(first) = published.first() {
            return Err(Error::Conflict(format!(
                "unable to drop: snapshot {} is published as {}",
                snapshot.name, first
            )));
        }
        let derived = all.snapshots.by_snapshot_source(&snapshot)?;
        if !force && !derived.is_empty() {
            let names: Vec<&str> = derived.iter().map(|s| s.name.as_str()).collect();
            return Err(Error::Conflict(format!(
                "snapshot {} was used as a source for snapshots {}, use force to drop it anyway",
                snapshot.name,
                names.join(", ")
            )));
        }

        (*all.snapshots).drop(&snapshot)?;
        info!("Dropped snapshot {}", snapshot.name);
        Ok(())
    }

    // Publishing

    /// Resource keys a publish of `request` must hold
    pub fn publish_resources(&self, request: &PublishRequest) -> Result<Vec<String>> {
        let mut resources = vec![prefix_resource_key(
            &request.storage,
            &normalize_prefix(&request.prefix)?,
        )];
        for (_, source) in &request.components {
            resources.push(match request.source_kind {
                Some(SourceKind::Local) => self.factory.local_repos().by_name(source)?.resource_key(),
                Some(SourceKind::Snapshot) => self.factory.snapshots().by_name(source)?.resource_key(),
                None => return Err(Error::Validation("source kind is required".to_string())),
            });
        }
        Ok(resources)
    }

    /// Resource keys an update or drop of a published repo must hold: its
    /// prefix, its current sources and the snapshots `switch` binds
    pub fn update_resources(
        &self,
        storage: &str,
        prefix: &str,
        distribution: &str,
        switch: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let prefix = normalize_prefix(prefix)?;
        let repo = self
            .factory
            .published_repos()
            .by_storage_prefix_distribution(storage, &prefix, distribution)?;

        let mut resources = vec![prefix_resource_key(storage, &prefix)];
        match repo.source_kind {
            SourceKind::Local => {
                let locals = self.factory.local_repos();
                for uuid in repo.sources.values() {
                    resources.push(locals.by_uuid(uuid)?.resource_key());
                }
            }
            SourceKind::Snapshot => {
                let snapshots = self.factory.snapshots();
                for uuid in repo.sources.values() {
                    resources.push(snapshots.by_uuid(uuid)?.resource_key());
                }
                for name in switch.values() {
                    resources.push(snapshots.by_name(name)?.resource_key());
                }
            }
        }
        resources.sort();
        resources.dedup();
        Ok(resources)
    }

    pub fn publish(&self, request: &PublishRequest, progress: &dyn Progress) -> Result<PublishReport> {
        let kind = request
            .source_kind
            .ok_or_else(|| Error::Validation("source kind is required".to_string()))?;
        if request.components.is_empty() {
            return Err(Error::Validation(
                "at least one component must be published".to_string(),
            ));
        }

        let mut sources = BTreeMap::new();
        for (component, name) in &request.components {
            let uuid = match kind {
                SourceKind::Local => self.factory.local_repos().by_name(name)?.uuid,
                SourceKind::Snapshot => self.factory.snapshots().by_name(name)?.uuid,
            };
            if sources.insert(component.clone(), uuid).is_some() {
                return Err(Error::Validation(format!(
                    "duplicate component name: {}",
                    component
                )));
            }
        }

        let architectures = if request.architectures.is_empty() {
            self.config.architectures.clone()
        } else {
            request.architectures.clone()
        };
        let mut repo = PublishedRepo::new(
            &request.storage,
            &request.prefix,
            &request.distribution,
            kind,
            sources,
            architectures,
        )?;
        repo.origin = request.origin.clone();
        repo.label = request.label.clone();

        let signer = self.signer(request.signing.as_ref())?;
        let options = PublishOptions {
            force_overwrite: request.force_overwrite,
            skip_contents: request.skip_contents || self.config.skip_contents_publishing,
            skip_cleanup: request.skip_cleanup,
            signer: signer.as_deref(),
        };
        self.publisher().publish(repo, &options, progress)
    }

    /// Re-publish, switching components to other snapshots when given
    #[allow(clippy::too_many_arguments)]
    pub fn update_published(
        &self,
        storage: &str,
        prefix: &str,
        distribution: &str,
        switch: &BTreeMap<String, String>,
        force_overwrite: bool,
        skip_cleanup: bool,
        signing: Option<&SigningOptions>,
        progress: &dyn Progress,
    ) -> Result<PublishReport> {
        let signer = self.signer(signing)?;
        let options = PublishOptions {
            force_overwrite,
            skip_contents: self.config.skip_contents_publishing,
            skip_cleanup,
            signer: signer.as_deref(),
        };
        let prefix = normalize_prefix(prefix)?;
        self.publisher()
            .update(storage, &prefix, distribution, switch, &options, progress)
    }

    pub fn drop_published(
        &self,
        storage: &str,
        prefix: &str,
        distribution: &str,
        skip_cleanup: bool,
        progress: &dyn Progress,
    ) -> Result<PublishReport> {
        let prefix = normalize_prefix(prefix)?;
        self.publisher()
            .drop(storage, &prefix, distribution, skip_cleanup, progress)
    }

    pub fn published_repos(&self) -> Result<Vec<PublishedRepo>> {
        self.factory.published_repos().list()
    }

    // Maintenance

    pub fn cleanup(&self, dry_run: bool, progress: &dyn Progress) -> Result<CleanupReport> {
        cleanup_database(&self.factory, &self.pool, dry_run, progress)
    }
}

/// Resource key of operations that create local repos
pub fn local_repos_resource() -> Vec<String> {
    vec![ALL_LOCAL_REPOS_RESOURCES_KEY.to_string()]
}
