// src/publish/published.rs

//! Published repositories
//!
//! A published repo is identified by storage, prefix and distribution. Each
//! component is bound to a local repo or a snapshot; the refs it was last
//! published with are stored alongside so prefix cleanup can tell which pool
//! files are still served.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::packages::PackageRefList;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Kind of entity bound to the components of a published repo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Snapshot,
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(SourceKind::Local),
            "snapshot" => Ok(SourceKind::Snapshot),
            other => Err(Error::Validation(format!("unknown source kind: {}", other))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Local => "local",
            SourceKind::Snapshot => "snapshot",
        })
    }
}

/// Resource key serializing every publish operation on one prefix
pub fn prefix_resource_key(storage: &str, prefix: &str) -> String {
    format!("prefix:{}:{}", storage, prefix)
}

/// Canonical prefix: `.` for the storage root, otherwise without outer slashes
pub fn normalize_prefix(prefix: &str) -> Result<String> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return Ok(".".to_string());
    }
    for part in trimmed.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(Error::Validation(format!("invalid prefix: {}", prefix)));
        }
    }
    if trimmed.ends_with("/dists") || trimmed == "dists" || trimmed.ends_with("/pool") || trimmed == "pool" {
        return Err(Error::Validation(format!(
            "invalid prefix {}: must not end with dists or pool",
            prefix
        )));
    }
    Ok(trimmed.to_string())
}

fn validate_part(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') || value.contains(char::is_whitespace) || value.starts_with('.') {
        return Err(Error::Validation(format!("invalid {}: {:?}", what, value)));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedRepo {
    pub uuid: String,
    /// Empty for the default public directory, `filesystem:<name>` otherwise
    #[serde(default)]
    pub storage: String,
    pub prefix: String,
    pub distribution: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub label: String,
    /// Explicit list, or empty to derive from the packages
    #[serde(default)]
    pub architectures: Vec<String>,
    pub source_kind: SourceKind,
    /// Component name to source uuid
    pub sources: BTreeMap<String, String>,
    /// Component name to the refs it was last published with
    #[serde(default)]
    pub refs: BTreeMap<String, PackageRefList>,
    #[serde(default)]
    pub skip_contents: bool,
    #[serde(default)]
    pub last_published: Option<DateTime<Utc>>,
}

impl PublishedRepo {
    pub fn new(
        storage: &str,
        prefix: &str,
        distribution: &str,
        source_kind: SourceKind,
        sources: BTreeMap<String, String>,
        architectures: Vec<String>,
    ) -> Result<Self> {
        let prefix = normalize_prefix(prefix)?;
        validate_part("distribution", distribution)?;
        if sources.is_empty() {
            return Err(Error::Validation(
                "at least one component must be published".to_string(),
            ));
        }
        for component in sources.keys() {
            validate_part("component", component)?;
        }
        for architecture in &architectures {
            validate_part("architecture", architecture)?;
        }

        Ok(Self {
            uuid: Uuid::new_v4().to_string(),
            storage: storage.to_string(),
            prefix,
            distribution: distribution.to_string(),
            origin: String::new(),
            label: String::new(),
            architectures,
            source_kind,
            sources,
            refs: BTreeMap::new(),
            skip_contents: false,
            last_published: None,
        })
    }

    pub fn key(&self) -> Vec<u8> {
        Self::key_for(&self.storage, &self.prefix, &self.distribution)
    }

    fn key_for(storage: &str, prefix: &str, distribution: &str) -> Vec<u8> {
        format!("U{}:{}>>{}", storage, prefix, distribution).into_bytes()
    }

    pub fn resource_key(&self) -> String {
        prefix_resource_key(&self.storage, &self.prefix)
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Path of the prefix inside the storage, `""` for the root
    pub fn prefix_path(&self) -> &str {
        if self.prefix == "." { "" } else { &self.prefix }
    }

    fn under_prefix(&self, path: &str) -> String {
        match self.prefix_path() {
            "" => path.to_string(),
            prefix => format!("{}/{}", prefix, path),
        }
    }

    /// `<prefix>/dists/<distribution>`
    pub fn dists_path(&self) -> String {
        self.under_prefix(&format!("dists/{}", self.distribution))
    }

    /// `<prefix>/pool/<component>`
    pub fn pool_path(&self, component: &str) -> String {
        self.under_prefix(&format!("pool/{}", component))
    }

    /// Every package ref this repo serves, across components
    pub fn all_refs(&self) -> PackageRefList {
        PackageRefList::from_refs(self.refs.values().flat_map(|list| list.iter().cloned()))
    }

    pub fn num_packages(&self) -> usize {
        self.refs.values().map(PackageRefList::len).sum()
    }
}

impl fmt::Display for PublishedRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = if self.storage.is_empty() {
            String::new()
        } else {
            format!("{}:", self.storage)
        };
        write!(f, "{}{}/{}", storage, self.prefix, self.distribution)
    }
}

pub struct PublishedRepoCollection {
    db: Arc<Database>,
}

impl PublishedRepoCollection {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a new published repo; each storage/prefix/distribution once
    pub fn add(&self, repo: &PublishedRepo) -> Result<()> {
        if self.db.get(&repo.key())?.is_some() {
            return Err(Error::Conflict(format!(
                "prefix/distribution already used by another published repo: {}",
                repo
            )));
        }
        self.update(repo)
    }

    pub fn update(&self, repo: &PublishedRepo) -> Result<()> {
        let encoded = serde_json::to_vec(repo)?;
        self.db.put(&repo.key(), &encoded)
    }

    pub fn by_storage_prefix_distribution(
        &self,
        storage: &str,
        prefix: &str,
        distribution: &str,
    ) -> Result<PublishedRepo> {
        let prefix = normalize_prefix(prefix)?;
        self.db
            .get_value(&PublishedRepo::key_for(storage, &prefix, distribution))?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "published repo with storage:prefix/distribution {}:{}/{} not found",
                    storage, prefix, distribution
                ))
            })
    }

    /// Every repo published under one storage prefix
    pub fn by_prefix(&self, storage: &str, prefix: &str) -> Result<Vec<PublishedRepo>> {
        let key = format!("U{}:{}>>", storage, normalize_prefix(prefix)?);
        self.db.fetch_values(key.as_bytes())
    }

    pub fn list(&self) -> Result<Vec<PublishedRepo>> {
        self.db.fetch_values(b"U")
    }

    pub fn by_local_repo(&self, uuid: &str) -> Result<Vec<PublishedRepo>> {
        self.by_source(SourceKind::Local, uuid)
    }

    pub fn by_snapshot(&self, uuid: &str) -> Result<Vec<PublishedRepo>> {
        self.by_source(SourceKind::Snapshot, uuid)
    }

    fn by_source(&self, kind: SourceKind, uuid: &str) -> Result<Vec<PublishedRepo>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|repo| repo.source_kind == kind && repo.sources.values().any(|id| id == uuid))
            .collect())
    }

    pub fn remove(&self, repo: &PublishedRepo) -> Result<()> {
        self.db.delete(&repo.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(c, s)| (c.to_string(), s.to_string()))
            .collect()
    }

    #[test]
    fn test_source_kind() {
        assert_eq!("local".parse::<SourceKind>().unwrap(), SourceKind::Local);
        assert_eq!("snapshot".parse::<SourceKind>().unwrap(), SourceKind::Snapshot);
        assert!(matches!("mirror".parse::<SourceKind>(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("").unwrap(), ".");
        assert_eq!(normalize_prefix("/").unwrap(), ".");
        assert_eq!(normalize_prefix("/debian/").unwrap(), "debian");
        assert_eq!(normalize_prefix("ppa/team").unwrap(), "ppa/team");
        assert!(normalize_prefix("../escape").is_err());
        assert!(normalize_prefix("a//b").is_err());
        assert!(normalize_prefix("debian/pool").is_err());
    }

    #[test]
    fn test_paths() {
        let root = PublishedRepo::new("", ".", "stable", SourceKind::Local, sources(&[("main", "u")]), vec![]).unwrap();
        assert_eq!(root.dists_path(), "dists/stable");
        assert_eq!(root.pool_path("main"), "pool/main");
        assert_eq!(root.to_string(), "./stable");
        assert_eq!(root.resource_key(), "prefix::.");

        let nested = PublishedRepo::new(
            "filesystem:web",
            "ppa",
            "bookworm",
            SourceKind::Snapshot,
            sources(&[("main", "u")]),
            vec!["amd64".to_string()],
        )
        .unwrap();
        assert_eq!(nested.dists_path(), "ppa/dists/bookworm");
        assert_eq!(nested.pool_path("main"), "ppa/pool/main");
        assert_eq!(nested.to_string(), "filesystem:web:ppa/bookworm");
        assert_eq!(nested.resource_key(), "prefix:filesystem:web:ppa");
    }

    #[test]
    fn test_new_validates() {
        let none = BTreeMap::new();
        assert!(PublishedRepo::new("", ".", "stable", SourceKind::Local, none, vec![]).is_err());
        assert!(PublishedRepo::new("", ".", "a/b", SourceKind::Local, sources(&[("main", "u")]), vec![]).is_err());
        assert!(PublishedRepo::new("", ".", "stable", SourceKind::Local, sources(&[("ma in", "u")]), vec![]).is_err());
    }

    #[test]
    fn test_collection() {
        let collection = PublishedRepoCollection::new(Arc::new(Database::in_memory().unwrap()));
        let stable = PublishedRepo::new("", "debian", "stable", SourceKind::Local, sources(&[("main", "l1")]), vec![]).unwrap();
        let testing = PublishedRepo::new("", "debian", "testing", SourceKind::Snapshot, sources(&[("main", "s1")]), vec![]).unwrap();
        let other = PublishedRepo::new("", "ubuntu", "stable", SourceKind::Local, sources(&[("main", "l1")]), vec![]).unwrap();
        for repo in [&stable, &testing, &other] {
            collection.add(repo).unwrap();
        }

        let duplicate = PublishedRepo::new("", "/debian/", "stable", SourceKind::Local, sources(&[("main", "l2")]), vec![]).unwrap();
        assert!(matches!(collection.add(&duplicate), Err(Error::Conflict(_))));

        assert_eq!(collection.by_prefix("", "debian").unwrap().len(), 2);
        assert_eq!(collection.by_local_repo("l1").unwrap().len(), 2);
        assert_eq!(collection.by_snapshot("s1").unwrap()[0].distribution, "testing");
        assert_eq!(
            collection.by_storage_prefix_distribution("", "debian/", "testing").unwrap().uuid,
            testing.uuid
        );

        collection.remove(&stable).unwrap();
        assert!(matches!(
            collection.by_storage_prefix_distribution("", "debian", "stable"),
            Err(Error::NotFound(_))
        ));
        assert_eq!(collection.list().unwrap().len(), 2);
    }
}
