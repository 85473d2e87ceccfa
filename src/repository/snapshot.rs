// src/repository/snapshot.rs

//! Snapshots: immutable, named package sets
//!
//! A snapshot freezes the ref list of a local repo, a mirror, or a merge
//! of other snapshots. Only the name and description change after creation.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::packages::{PackageCollection, PackageDiff, PackageRefList};
use crate::repository::local::LocalRepo;
use crate::repository::remote::RemoteRepo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// What a snapshot was created from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Local,
    Repo,
    Snapshot,
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SnapshotSource::Local => "local",
            SnapshotSource::Repo => "repo",
            SnapshotSource::Snapshot => "snapshot",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub uuid: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub source_kind: SnapshotSource,
    /// UUIDs of the repos or snapshots this one was built from
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    ref_list: Option<PackageRefList>,
}

impl Snapshot {
    fn with_refs(
        name: &str,
        source_kind: SnapshotSource,
        source_ids: Vec<String>,
        description: String,
        refs: PackageRefList,
    ) -> Result<Self> {
        super::validate_name(name)?;
        Ok(Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            source_kind,
            source_ids,
            description,
            ref_list: Some(refs),
        })
    }

    /// Freeze the current contents of a loaded local repo
    pub fn from_local_repo(name: &str, repo: &LocalRepo) -> Result<Self> {
        Self::with_refs(
            name,
            SnapshotSource::Local,
            vec![repo.uuid.clone()],
            format!("Snapshot from local repo [{}]", repo.name),
            repo.loaded_refs()?.clone(),
        )
    }

    /// Freeze the last downloaded state of a loaded mirror
    pub fn from_remote_repo(name: &str, repo: &RemoteRepo) -> Result<Self> {
        if repo.last_download_date.is_none() {
            return Err(Error::Validation(format!(
                "mirror {} has not been downloaded yet",
                repo.name
            )));
        }
        Self::with_refs(
            name,
            SnapshotSource::Repo,
            vec![repo.uuid.clone()],
            format!("Snapshot from mirror [{}]: {}", repo.name, repo.archive_root),
            repo.loaded_refs()?.clone(),
        )
    }

    /// Merge loaded snapshots left to right
    ///
    /// By default a later source replaces every package of the same
    /// architecture and name. With `latest`, all versions are pooled and
    /// only the newest of each architecture/name is kept.
    pub fn merge(name: &str, sources: &[Snapshot], latest: bool) -> Result<Self> {
        let (first, rest) = sources.split_first().ok_or_else(|| {
            Error::Validation("at least one snapshot is required for merge".to_string())
        })?;

        let mut refs = first.loaded_refs()?.clone();
        for source in rest {
            let theirs = source.loaded_refs()?;
            refs = if latest {
                refs.merge(theirs, false, true)?
            } else {
                let replaced: HashSet<(&str, &str)> = theirs
                    .iter()
                    .map(|r| (r.architecture(), r.name()))
                    .collect();
                refs.filter(|r| !replaced.contains(&(r.architecture(), r.name())))
                    .merge(theirs, true, false)?
            };
        }
        if latest {
            refs = refs.filter_latest();
        }

        let names: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        Self::with_refs(
            name,
            SnapshotSource::Snapshot,
            sources.iter().map(|s| s.uuid.clone()).collect(),
            format!("Merged from sources: {}", names.join(", ")),
            refs,
        )
    }

    pub fn key(&self) -> Vec<u8> {
        format!("S{}", self.uuid).into_bytes()
    }

    pub fn ref_key(&self) -> Vec<u8> {
        format!("E{}", self.uuid).into_bytes()
    }

    pub fn resource_key(&self) -> String {
        format!("S{}", self.uuid)
    }

    pub fn ref_list(&self) -> Option<&PackageRefList> {
        self.ref_list.as_ref()
    }

    pub fn loaded_refs(&self) -> Result<&PackageRefList> {
        self.ref_list
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("snapshot {} is not loaded", self.name)))
    }

    pub fn num_packages(&self) -> usize {
        self.ref_list.as_ref().map_or(0, PackageRefList::len)
    }
}

/// Differences between two loaded snapshots
///
/// With `only_matching`, packages present on one side only are left out.
pub fn diff(
    left: &Snapshot,
    right: &Snapshot,
    packages: &PackageCollection,
    only_matching: bool,
) -> Result<Vec<PackageDiff>> {
    let mut result = left.loaded_refs()?.diff(right.loaded_refs()?, packages)?;
    if only_matching {
        result.retain(|d| d.left.is_some() && d.right.is_some());
    }
    Ok(result)
}

pub struct SnapshotCollection {
    db: Arc<Database>,
}

impl SnapshotCollection {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn add(&self, snapshot: &Snapshot) -> Result<()> {
        if self.by_name(&snapshot.name).is_ok() {
            return Err(Error::Conflict(format!(
                "snapshot with name {} already exists",
                snapshot.name
            )));
        }
        self.update(snapshot)
    }

    pub fn update(&self, snapshot: &Snapshot) -> Result<()> {
        let mut batch = self.db.create_batch();
        batch.put_value(snapshot.key(), snapshot)?;
        if let Some(list) = &snapshot.ref_list {
            batch.put_value(snapshot.ref_key(), list)?;
        }
        self.db.write(batch)
    }

    /// Change name and description; names stay unique
    pub fn rename(&self, snapshot: &mut Snapshot, name: &str, description: Option<&str>) -> Result<()> {
        super::validate_name(name)?;
        if name != snapshot.name && self.by_name(name).is_ok() {
            return Err(Error::Conflict(format!(
                "snapshot with name {} already exists",
                name
            )));
        }
        snapshot.name = name.to_string();
        if let Some(description) = description {
            snapshot.description = description.to_string();
        }
        let mut batch = self.db.create_batch();
        batch.put_value(snapshot.key(), snapshot)?;
        self.db.write(batch)
    }

    pub fn load_complete(&self, snapshot: &mut Snapshot) -> Result<()> {
        let list = self
            .db
            .get_value::<PackageRefList>(&snapshot.ref_key())?
            .unwrap_or_default();
        snapshot.ref_list = Some(list);
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self.db.fetch_values(b"S")?;
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    pub fn by_name(&self, name: &str) -> Result<Snapshot> {
        self.list()?
            .into_iter()
            .find(|snapshot| snapshot.name == name)
            .ok_or_else(|| Error::NotFound(format!("snapshot with name {} not found", name)))
    }

    pub fn by_uuid(&self, uuid: &str) -> Result<Snapshot> {
        self.db
            .get_value(format!("S{}", uuid).as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("snapshot with uuid {} not found", uuid)))
    }

    fn by_source(&self, kind: SnapshotSource, uuid: &str) -> Result<Vec<Snapshot>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.source_kind == kind && s.source_ids.iter().any(|id| id == uuid))
            .collect())
    }

    pub fn by_local_repo_source(&self, repo: &LocalRepo) -> Result<Vec<Snapshot>> {
        self.by_source(SnapshotSource::Local, &repo.uuid)
    }

    pub fn by_remote_repo_source(&self, repo: &RemoteRepo) -> Result<Vec<Snapshot>> {
        self.by_source(SnapshotSource::Repo, &repo.uuid)
    }

    pub fn by_snapshot_source(&self, snapshot: &Snapshot) -> Result<Vec<Snapshot>> {
        self.by_source(SnapshotSource::Snapshot, &snapshot.uuid)
    }

    pub fn drop(&self, snapshot: &Snapshot) -> Result<()> {
        let mut batch = self.db.create_batch();
        batch.delete(snapshot.key());
        batch.delete(snapshot.ref_key());
        self.db.write(batch)
    }
}
