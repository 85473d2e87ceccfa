// src/packages/reflist.rs

//! Sorted, deduplicated lists of package references and their set algebra
//!
//! Every repository entity stores its contents as a [`PackageRefList`].
//! Garbage collection and snapshot merging are computed purely from these
//! lists, so merge and subtract must be exact set operations.

use crate::error::{Error, Result};
use crate::packages::collection::PackageCollection;
use crate::packages::package::{Package, PackageRef};
use crate::packages::version::compare_versions;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRefList {
    #[serde(rename = "Refs")]
    refs: Vec<PackageRef>,
}

/// One side-by-side difference between two lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDiff {
    pub left: Option<Package>,
    pub right: Option<Package>,
}

impl PackageRefList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_refs(refs: impl IntoIterator<Item = PackageRef>) -> Self {
        let mut refs: Vec<PackageRef> = refs.into_iter().collect();
        refs.sort();
        refs.dedup();
        Self { refs }
    }

    pub fn from_packages<'a>(packages: impl IntoIterator<Item = &'a Package>) -> Self {
        Self::from_refs(packages.into_iter().map(Package::reference))
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn refs(&self) -> &[PackageRef] {
        &self.refs
    }

    pub fn iter(&self) -> impl Iterator<Item = &PackageRef> {
        self.refs.iter()
    }

    pub fn has(&self, reference: &PackageRef) -> bool {
        self.refs.binary_search(reference).is_ok()
    }

    /// Visit every ref in order, stopping at the first error
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&PackageRef) -> Result<()>,
    {
        for reference in &self.refs {
            f(reference)?;
        }
        Ok(())
    }

    /// Insert keeping the list sorted; returns false if already present
    pub fn add(&mut self, reference: PackageRef) -> bool {
        match self.refs.binary_search(&reference) {
            Ok(_) => false,
            Err(position) => {
                self.refs.insert(position, reference);
                true
            }
        }
    }

    pub fn remove(&mut self, reference: &PackageRef) -> bool {
        match self.refs.binary_search(reference) {
            Ok(position) => {
                self.refs.remove(position);
                true
            }
            Err(_) => false,
        }
    }

    /// A ref for the same architecture, name and version but different content
    pub fn find_conflict(&self, reference: &PackageRef) -> Option<&PackageRef> {
        self.refs
            .iter()
            .find(|existing| existing.same_package(reference) && *existing != reference)
    }

    /// Union of both lists
    ///
    /// Refs sharing architecture, name and version form a group. When both
    /// sides carry a group with different contents, `overwrite` keeps
    /// `other`'s group, `ignore_conflicts` keeps ours, and otherwise the
    /// merge fails with a conflict.
    pub fn merge(
        &self,
        other: &PackageRefList,
        overwrite: bool,
        ignore_conflicts: bool,
    ) -> Result<PackageRefList> {
        let (left, right) = (&self.refs, &other.refs);
        let mut refs = Vec::with_capacity(left.len() + right.len());
        let (mut il, mut ir) = (0, 0);

        loop {
            let order = match (left.get(il), right.get(ir)) {
                (Some(l), Some(r)) => l.package_key().cmp(r.package_key()),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => break,
            };
            let (el, er) = (group_end(left, il), group_end(right, ir));

            match order {
                Ordering::Less => {
                    refs.extend_from_slice(&left[il..el]);
                    il = el;
                }
                Ordering::Greater => {
                    refs.extend_from_slice(&right[ir..er]);
                    ir = er;
                }
                Ordering::Equal => {
                    let (ours, theirs) = (&left[il..el], &right[ir..er]);
                    if ours == theirs || (!overwrite && ignore_conflicts) {
                        refs.extend_from_slice(ours);
                    } else if overwrite {
                        refs.extend_from_slice(theirs);
                    } else {
                        let differing = theirs
                            .iter()
                            .find(|r| !ours.contains(r))
                            .unwrap_or(&theirs[0]);
                        return Err(Error::Conflict(format!(
                            "package conflict: {} and {} have different contents",
                            ours[0], differing
                        )));
                    }
                    il = el;
                    ir = er;
                }
            }
        }

        Ok(Self { refs })
    }

    /// Refs of `self` that are not in `other`
    pub fn subtract(&self, other: &PackageRefList) -> PackageRefList {
        let mut refs = Vec::with_capacity(self.refs.len());
        let mut theirs = other.refs.iter().peekable();

        for reference in &self.refs {
            while theirs.next_if(|r| *r < reference).is_some() {}
            if theirs.peek() != Some(&reference) {
                refs.push(reference.clone());
            }
        }

        Self { refs }
    }

    /// Refs matching `predicate`, order preserved
    pub fn filter<F>(&self, mut predicate: F) -> PackageRefList
    where
        F: FnMut(&PackageRef) -> bool,
    {
        Self {
            refs: self.refs.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    /// Keep only the newest version of every architecture/name pair
    pub fn filter_latest(&self) -> PackageRefList {
        let mut refs: Vec<PackageRef> = Vec::with_capacity(self.refs.len());
        for reference in &self.refs {
            if let Some(last) = refs.last_mut() {
                if last.architecture() == reference.architecture() && last.name() == reference.name() {
                    if compare_versions(reference.version(), last.version()) == Ordering::Greater {
                        *last = reference.clone();
                    }
                    continue;
                }
            }
            refs.push(reference.clone());
        }
        Self { refs }
    }

    /// Pairwise differences by architecture/name, loading packages from
    /// `collection`. Entries identical on both sides are omitted.
    pub fn diff(
        &self,
        other: &PackageRefList,
        collection: &PackageCollection,
    ) -> Result<Vec<PackageDiff>> {
        let left: Vec<&PackageRef> = self.refs.iter().filter(|r| !other.has(r)).collect();
        let right: Vec<&PackageRef> = other.refs.iter().filter(|r| !self.has(r)).collect();

        let mut result = Vec::new();
        let (mut il, mut ir) = (0, 0);
        while il < left.len() || ir < right.len() {
            let (rl, rr) = match (left.get(il), right.get(ir)) {
                (Some(rl), Some(rr)) => (*rl, *rr),
                (Some(rl), None) => {
                    result.push(PackageDiff {
                        left: Some(collection.by_key(rl)?),
                        right: None,
                    });
                    il += 1;
                    continue;
                }
                (None, Some(rr)) => {
                    result.push(PackageDiff {
                        left: None,
                        right: Some(collection.by_key(rr)?),
                    });
                    ir += 1;
                    continue;
                }
                (None, None) => break,
            };

            if rl.architecture() == rr.architecture() && rl.name() == rr.name() {
                result.push(PackageDiff {
                    left: Some(collection.by_key(rl)?),
                    right: Some(collection.by_key(rr)?),
                });
                il += 1;
                ir += 1;
            } else if rl < rr {
                result.push(PackageDiff {
                    left: Some(collection.by_key(rl)?),
                    right: None,
                });
                il += 1;
            } else {
                result.push(PackageDiff {
                    left: None,
                    right: Some(collection.by_key(rr)?),
                });
                ir += 1;
            }
        }

        Ok(result)
    }
}

/// End of the group of refs starting at `start` that share a package key
fn group_end(refs: &[PackageRef], start: usize) -> usize {
    let Some(first) = refs.get(start) else {
        return start;
    };
    let key = first.package_key();
    let mut end = start + 1;
    while end < refs.len() && refs[end].package_key() == key {
        end += 1;
    }
    end
}

impl FromIterator<PackageRef> for PackageRefList {
    fn from_iter<I: IntoIterator<Item = PackageRef>>(iter: I) -> Self {
        Self::from_refs(iter)
    }
}

impl<'a> IntoIterator for &'a PackageRefList {
    type Item = &'a PackageRef;
    type IntoIter = std::slice::Iter<'a, PackageRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.refs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::packages::package::PackageFile;
    use crate::packages::stanza::parse_stanza;
    use crate::pool::ChecksumInfo;
    use std::sync::Arc;

    fn pkg(arch: &str, name: &str, version: &str, body: &str) -> Package {
        let control = format!(
            "Package: {}\nVersion: {}\nArchitecture: {}\n",
            name, version, arch
        );
        let mut package = Package::from_control(parse_stanza(&control).unwrap()).unwrap();
        package.files.push(PackageFile::new(
            format!("{}_{}_{}.deb", name, version, arch),
            ChecksumInfo::compute_bytes(body.as_bytes()),
        ));
        package
    }

    fn r(arch: &str, name: &str, version: &str, body: &str) -> PackageRef {
        pkg(arch, name, version, body).reference()
    }

    fn list(refs: &[PackageRef]) -> PackageRefList {
        refs.iter().cloned().collect()
    }

    #[test]
    fn test_filter() {
        let a = r("amd64", "a", "1", "x");
        let b = r("i386", "a", "1", "x");
        let l = list(&[a.clone(), b.clone()]);

        assert_eq!(l.filter(|r| r.architecture() == "i386").refs(), &[b]);
        assert!(l.filter(|_| false).is_empty());
    }

    #[test]
    fn test_sorted_and_deduplicated() {
        let a = r("amd64", "b", "1", "x");
        let b = r("amd64", "a", "1", "x");
        let l = list(&[a.clone(), b.clone(), a.clone()]);

        assert_eq!(l.len(), 2);
        assert_eq!(l.refs(), &[b.clone(), a.clone()]);
        assert!(l.has(&a));

        let mut visited = 0;
        l.for_each(|_| {
            visited += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_add_and_remove() {
        let mut l = PackageRefList::new();
        let a = r("amd64", "a", "1", "x");
        assert!(l.add(a.clone()));
        assert!(!l.add(a.clone()));
        assert!(l.remove(&a));
        assert!(!l.remove(&a));
        assert!(l.is_empty());
    }

    #[test]
    fn test_merge_with_self_is_identity() {
        let a = list(&[
            r("amd64", "a", "1", "x"),
            r("amd64", "b", "2", "y"),
            r("i386", "a", "1", "x"),
        ]);
        assert_eq!(a.merge(&a, false, true).unwrap(), a);
        assert_eq!(a.merge(&a, false, false).unwrap(), a);
        assert_eq!(a.merge(&a, true, false).unwrap(), a);
    }

    #[test]
    fn test_merge_union() {
        let a = list(&[r("amd64", "a", "1", "x"), r("amd64", "c", "1", "x")]);
        let b = list(&[r("amd64", "b", "1", "x"), r("amd64", "c", "1", "x")]);

        let merged = a.merge(&b, false, false).unwrap();
        assert_eq!(merged.len(), 3);
        assert!(a.iter().chain(b.iter()).all(|x| merged.has(x)));
    }

    #[test]
    fn test_merge_conflicts() {
        let ours = r("amd64", "a", "1", "ours");
        let theirs = r("amd64", "a", "1", "theirs");
        let a = list(&[ours.clone()]);
        let b = list(&[theirs.clone()]);

        assert!(matches!(a.merge(&b, false, false), Err(Error::Conflict(_))));
        assert_eq!(a.merge(&b, true, false).unwrap().refs(), &[theirs.clone()]);
        assert_eq!(a.merge(&b, false, true).unwrap().refs(), &[ours.clone()]);
    }

    #[test]
    fn test_merge_then_subtract_keeps_difference() {
        let shared = r("amd64", "s", "1", "x");
        let only_a = r("amd64", "a", "1", "x");
        let conflict_a = r("amd64", "c", "1", "a");
        let conflict_b = r("amd64", "c", "1", "b");
        let a = list(&[shared.clone(), only_a.clone(), conflict_a.clone()]);
        let b = list(&[shared.clone(), conflict_b.clone(), r("amd64", "z", "1", "x")]);

        let expected = a.subtract(&b);
        let result = a.merge(&b, false, true).unwrap().subtract(&b);
        assert!(expected.iter().all(|x| result.has(x)));
        assert_eq!(expected.refs(), &[only_a, conflict_a]);
    }

    #[test]
    fn test_subtract() {
        let x = r("amd64", "x", "1", "x");
        let y = r("amd64", "y", "1", "x");
        let z = r("amd64", "z", "1", "x");
        let a = list(&[x.clone(), y.clone(), z.clone()]);
        let b = list(&[y.clone(), r("amd64", "w", "1", "x")]);

        assert_eq!(a.subtract(&b).refs(), &[x, z]);
        assert!(a.subtract(&a).is_empty());
        assert_eq!(a.subtract(&PackageRefList::new()), a);
    }

    #[test]
    fn test_filter_latest() {
        let l = list(&[
            r("amd64", "a", "1.0", "x"),
            r("amd64", "a", "1.10", "x"),
            r("amd64", "a", "1.9", "x"),
            r("i386", "a", "1.0", "x"),
        ]);
        let latest = l.filter_latest();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest.refs()[0].version(), "1.10");
    }

    #[test]
    fn test_diff() {
        let db = Arc::new(Database::in_memory().unwrap());
        let collection = PackageCollection::new(db);

        let same = pkg("amd64", "same", "1", "x");
        let old = pkg("amd64", "upgraded", "1", "x");
        let new = pkg("amd64", "upgraded", "2", "x");
        let gone = pkg("amd64", "gone", "1", "x");
        let added = pkg("i386", "added", "1", "x");
        for p in [&same, &old, &new, &gone, &added] {
            collection.update(p).unwrap();
        }

        let left = PackageRefList::from_packages([&same, &old, &gone]);
        let right = PackageRefList::from_packages([&same, &new, &added]);
        let diff = left.diff(&right, &collection).unwrap();

        assert_eq!(diff.len(), 3);
        assert!(diff.contains(&PackageDiff {
            left: Some(gone.clone()),
            right: None
        }));
        assert!(diff.contains(&PackageDiff {
            left: Some(old.clone()),
            right: Some(new.clone())
        }));
        assert!(diff.contains(&PackageDiff {
            left: None,
            right: Some(added.clone())
        }));
    }

    #[test]
    fn test_diff_skips_refs_on_both_sides() {
        let db = Arc::new(Database::in_memory().unwrap());
        let collection = PackageCollection::new(db);

        let first = pkg("amd64", "a", "1", "x");
        let second = pkg("amd64", "a", "2", "x");
        for p in [&first, &second] {
            collection.update(p).unwrap();
        }

        let left = PackageRefList::from_packages([&first, &second]);
        let right = PackageRefList::from_packages([&second]);
        assert_eq!(
            left.diff(&right, &collection).unwrap(),
            vec![PackageDiff {
                left: Some(first.clone()),
                right: None
            }]
        );
        assert_eq!(
            right.diff(&left, &collection).unwrap(),
            vec![PackageDiff {
                left: None,
                right: Some(first.clone())
            }]
        );
    }
}
