// src/repository/mod.rs

//! Repository entities and their collections
//!
//! Local repos, mirrors and snapshots each own a [`PackageRefList`]. The
//! [`CollectionFactory`] hands out the collections behind one mutex per
//! kind. Operations touching more than one kind lock them in the fixed
//! order remote repos, local repos, snapshots, published repos; the
//! accessors are listed in that order and [`CollectionFactory::lock_all`]
//! takes all four at once.
//!
//! [`PackageRefList`]: crate::packages::PackageRefList

pub mod cleanup;
pub mod download;
pub mod local;
pub mod parsers;
pub mod remote;
pub mod snapshot;

pub use cleanup::{CleanupReport, cleanup_database};
pub use download::{Downloader, HttpDownloader};
pub use local::{ImportResult, LocalRepo, LocalRepoCollection};
pub use remote::{MirrorUpdate, RemoteRepo, RemoteRepoCollection};
pub use snapshot::{Snapshot, SnapshotCollection, SnapshotSource};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::packages::PackageCollection;
use crate::pool::ChecksumCollection;
use crate::publish::PublishedRepoCollection;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Names of repos, mirrors and snapshots: non-empty, no `/`, no whitespace
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("name must not be empty".to_string()));
    }
    if name.contains('/') || name.contains(char::is_whitespace) {
        return Err(Error::Validation(format!(
            "invalid name {:?}: must not contain '/' or whitespace",
            name
        )));
    }
    Ok(())
}

/// Guards of every collection, taken in lock order
pub struct AllCollections<'a> {
    pub remote: MutexGuard<'a, RemoteRepoCollection>,
    pub local: MutexGuard<'a, LocalRepoCollection>,
    pub snapshots: MutexGuard<'a, SnapshotCollection>,
    pub published: MutexGuard<'a, PublishedRepoCollection>,
}

/// Access point to every persisted collection
pub struct CollectionFactory {
    db: Arc<Database>,
    remote: Mutex<RemoteRepoCollection>,
    local: Mutex<LocalRepoCollection>,
    snapshots: Mutex<SnapshotCollection>,
    published: Mutex<PublishedRepoCollection>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CollectionFactory {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            remote: Mutex::new(RemoteRepoCollection::new(db.clone())),
            local: Mutex::new(LocalRepoCollection::new(db.clone())),
            snapshots: Mutex::new(SnapshotCollection::new(db.clone())),
            published: Mutex::new(PublishedRepoCollection::new(db.clone())),
            db,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn remote_repos(&self) -> MutexGuard<'_, RemoteRepoCollection> {
        lock(&self.remote)
    }

    pub fn local_repos(&self) -> MutexGuard<'_, LocalRepoCollection> {
        lock(&self.local)
    }

    pub fn snapshots(&self) -> MutexGuard<'_, SnapshotCollection> {
        lock(&self.snapshots)
    }

    pub fn published_repos(&self) -> MutexGuard<'_, PublishedRepoCollection> {
        lock(&self.published)
    }

    pub fn lock_all(&self) -> AllCollections<'_> {
        let remote = self.remote_repos();
        let local = self.local_repos();
        let snapshots = self.snapshots();
        let published = self.published_repos();
        AllCollections {
            remote,
            local,
            snapshots,
            published,
        }
    }

    /// Packages are immutable once stored and need no lock
    pub fn packages(&self) -> PackageCollection {
        PackageCollection::new(self.db.clone())
    }

    pub fn checksums(&self) -> ChecksumCollection {
        ChecksumCollection::new(self.db.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("stable-2024").is_ok());
        assert!(matches!(validate_name(""), Err(Error::Validation(_))));
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("tab\there").is_err());
    }

    #[test]
    fn test_lock_all_releases() {
        let factory = CollectionFactory::new(Arc::new(Database::in_memory().unwrap()));
        {
            let all = factory.lock_all();
            assert_eq!(all.local.len().unwrap(), 0);
        }
        // Individual guards are available again once the set is dropped
        assert_eq!(factory.snapshots().list().unwrap().len(), 0);
        assert_eq!(factory.remote_repos().list().unwrap().len(), 0);
    }
}
