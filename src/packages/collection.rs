// src/packages/collection.rs

//! Persisted packages, keyed by their reference

use crate::db::{Batch, Database};
use crate::error::{Error, Result};
use crate::packages::package::{Package, PackageRef};
use crate::packages::reflist::PackageRefList;
use std::sync::Arc;
use tracing::debug;

/// Prefix shared by every package key (a ref already starts with it)
const PACKAGE_PREFIX: &[u8] = b"P";

pub struct PackageCollection {
    db: Arc<Database>,
}

impl PackageCollection {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn by_key(&self, reference: &PackageRef) -> Result<Package> {
        self.db
            .get_value(reference.as_bytes())?
            .ok_or_else(|| Error::NotFound(format!("package {} not found", reference)))
    }

    /// Load every package in `list`
    pub fn by_refs(&self, list: &PackageRefList) -> Result<Vec<Package>> {
        list.iter().map(|reference| self.by_key(reference)).collect()
    }

    fn check_existing(&self, package: &Package, reference: &PackageRef) -> Result<bool> {
        match self.db.get_value::<Package>(reference.as_bytes())? {
            None => Ok(false),
            Some(existing) if existing == *package => Ok(true),
            Some(existing) => {
                // Same files, different metadata: keep the stored package
                // unless only pool placement was unknown before.
                let same_files = existing.files.len() == package.files.len()
                    && existing
                        .files
                        .iter()
                        .zip(&package.files)
                        .all(|(a, b)| a.filename == b.filename && a.checksums == b.checksums);
                if same_files && existing.stanza == package.stanza {
                    Ok(false)
                } else {
                    Err(Error::Conflict(format!(
                        "unable to save {}: conflict with existing package",
                        package.short_key()
                    )))
                }
            }
        }
    }

    /// Store a package; identical re-adds are no-ops
    pub fn update(&self, package: &Package) -> Result<()> {
        let reference = package.reference();
        if self.check_existing(package, &reference)? {
            return Ok(());
        }
        debug!("Storing package {}", reference);
        let encoded = serde_json::to_vec(package)?;
        self.db.put(reference.as_bytes(), &encoded)
    }

    /// Queue a package write into `batch`
    pub fn update_in_batch(&self, batch: &mut Batch, package: &Package) -> Result<()> {
        let reference = package.reference();
        if self.check_existing(package, &reference)? {
            return Ok(());
        }
        batch.put_value(reference.as_bytes(), package)
    }

    pub fn delete_in_batch(&self, batch: &mut Batch, reference: &PackageRef) {
        batch.delete(reference.as_bytes());
    }

    /// Every stored package ref
    pub fn all_refs(&self) -> Result<PackageRefList> {
        let mut refs = Vec::new();
        for key in self.db.keys_by_prefix(PACKAGE_PREFIX)? {
            let key = String::from_utf8(key)
                .map_err(|e| Error::Internal(format!("non-UTF-8 package key: {}", e)))?;
            refs.push(PackageRef::parse(&key)?);
        }
        Ok(PackageRefList::from_refs(refs))
    }

    /// Refs in `list` whose package name matches
    pub fn search_by_name(&self, list: &PackageRefList, name: &str) -> PackageRefList {
        list.iter()
            .filter(|reference| reference.name() == name)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::package::PackageFile;
    use crate::packages::stanza::parse_stanza;
    use crate::pool::ChecksumInfo;

    fn pkg(name: &str, body: &[u8]) -> Package {
        let stanza = parse_stanza(&format!(
            "Package: {}\nVersion: 1.0\nArchitecture: amd64\n",
            name
        ))
        .unwrap();
        let mut package = Package::from_control(stanza).unwrap();
        package.files.push(PackageFile::new(
            format!("{}_1.0_amd64.deb", name),
            ChecksumInfo::compute_bytes(body),
        ));
        package
    }

    #[test]
    fn test_update_and_load() {
        let collection = PackageCollection::new(Arc::new(Database::in_memory().unwrap()));
        let package = pkg("hello", b"hello");

        collection.update(&package).unwrap();
        collection.update(&package).unwrap();

        assert_eq!(collection.by_key(&package.reference()).unwrap(), package);
        assert_eq!(collection.all_refs().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_package() {
        let collection = PackageCollection::new(Arc::new(Database::in_memory().unwrap()));
        let missing = pkg("missing", b"x").reference();
        assert!(matches!(collection.by_key(&missing), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_conflicting_metadata() {
        let collection = PackageCollection::new(Arc::new(Database::in_memory().unwrap()));
        let package = pkg("hello", b"hello");
        collection.update(&package).unwrap();

        let mut changed = package.clone();
        changed.stanza.set("Description", "something else");
        assert!(matches!(
            collection.update(&changed),
            Err(Error::Conflict(_))
        ));

        let mut placed = package.clone();
        placed.files[0].pool_path = "ab/cd/ef_hello_1.0_amd64.deb".to_string();
        collection.update(&placed).unwrap();
        assert_eq!(collection.by_key(&package.reference()).unwrap(), placed);
    }

    #[test]
    fn test_batch_and_search() {
        let db = Arc::new(Database::in_memory().unwrap());
        let collection = PackageCollection::new(db.clone());
        let a = pkg("a", b"a");
        let b = pkg("b", b"b");

        let mut batch = db.create_batch();
        collection.update_in_batch(&mut batch, &a).unwrap();
        collection.update_in_batch(&mut batch, &b).unwrap();
        db.write(batch).unwrap();

        let all = collection.all_refs().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(collection.search_by_name(&all, "b").refs(), &[b.reference()]);

        let mut batch = db.create_batch();
        collection.delete_in_batch(&mut batch, &a.reference());
        db.write(batch).unwrap();
        assert_eq!(collection.all_refs().unwrap().len(), 1);
    }
}
