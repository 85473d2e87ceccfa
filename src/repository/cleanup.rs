// src/repository/cleanup.rs

//! Garbage collection of packages and pool files
//!
//! Runs with every collection locked so no repo, snapshot or published
//! repo can gain a reference while the unreferenced set is computed.

use crate::error::Result;
use crate::packages::PackageRefList;
use crate::pool::{ChecksumStorage, PackagePool};
use crate::repository::CollectionFactory;
use crate::task::Progress;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub packages_removed: usize,
    pub files_removed: usize,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

/// Delete packages no entity references, then pool files no package uses
pub fn cleanup_database(
    factory: &CollectionFactory,
    pool: &PackagePool,
    dry_run: bool,
    progress: &dyn Progress,
) -> Result<CleanupReport> {
    let all = factory.lock_all();
    let mut report = CleanupReport {
        dry_run,
        ..Default::default()
    };

    progress.colored_printf(format_args!("Loading mirrors, local repos, snapshots and published repos..."));
    let mut referenced: Vec<PackageRefList> = Vec::new();
    for mut repo in all.remote.list()? {
        all.remote.load_complete(&mut repo)?;
        referenced.push(repo.loaded_refs()?.clone());
    }
    for mut repo in all.local.list()? {
        all.local.load_complete(&mut repo)?;
        referenced.push(repo.loaded_refs()?.clone());
    }
    for mut snapshot in all.snapshots.list()? {
        all.snapshots.load_complete(&mut snapshot)?;
        referenced.push(snapshot.loaded_refs()?.clone());
    }
    for published in all.published.list()? {
        referenced.push(published.all_refs());
    }
    let referenced =
        PackageRefList::from_refs(referenced.iter().flat_map(|list| list.iter().cloned()));

    progress.colored_printf(format_args!("Loading list of all packages..."));
    let packages = factory.packages();
    let to_delete = packages.all_refs()?.subtract(&referenced);
    report.packages_removed = to_delete.len();

    if !to_delete.is_empty() {
        progress.colored_printf(format_args!(
            "Deleting unreferenced packages ({})...",
            to_delete.len()
        ));
        if !dry_run {
            let db = factory.db();
            let mut batch = db.create_batch();
            for reference in &to_delete {
                packages.delete_in_batch(&mut batch, reference);
            }
            db.write(batch)?;
        }
    }

    progress.colored_printf(format_args!("Building list of files referenced by packages..."));
    let mut used: HashSet<String> = HashSet::new();
    for package in packages.by_refs(&referenced)? {
        for file in package.files {
            if !file.pool_path.is_empty() {
                used.insert(file.pool_path);
            }
        }
    }

    let checksums = factory.checksums();
    for path in pool.filepath_list()? {
        if used.contains(&path) {
            continue;
        }
        report.files_removed += 1;
        if dry_run {
            report.bytes_freed += pool.size(&path)?;
            debug!("Would remove {}", path);
            continue;
        }
        report.bytes_freed += pool.remove(&path)?;
        checksums.delete(&path)?;
    }

    if !dry_run {
        factory.db().compact()?;
    }

    info!(
        "Cleanup{}: {} packages, {} files, {} bytes",
        if dry_run { " (dry run)" } else { "" },
        report.packages_removed,
        report.files_removed,
        report.bytes_freed
    );
    progress.colored_printf(format_args!(
        "@g[+]@| {} {} unreferenced files ({} bytes)",
        if dry_run { "Would delete" } else { "Deleted" },
        report.files_removed,
        report.bytes_freed
    ));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::packages::deb::testing::build_deb;
    use crate::repository::local::{LocalRepo, collect_package_files, import_packages};
    use crate::repository::snapshot::Snapshot;
    use crate::task::Output;
    use std::sync::Arc;

    fn import(
        factory: &CollectionFactory,
        pool: &PackagePool,
        dir: &std::path::Path,
        name: &str,
        packages: &[(&str, &str)],
    ) -> LocalRepo {
        let incoming = dir.join(format!("in-{}", name));
        std::fs::create_dir_all(&incoming).unwrap();
        for (package, version) in packages {
            build_deb(&incoming, package, version, "amd64", name.as_bytes());
        }
        let mut repo = LocalRepo::new(name, "").unwrap();
        let mut list = PackageRefList::new();
        import_packages(
            &collect_package_files(&[incoming]).unwrap(),
            &mut list,
            false,
            pool,
            &factory.checksums(),
            &factory.packages(),
            &Output::new(),
        )
        .unwrap();
        repo.update_ref_list(list);
        factory.local_repos().add(&repo).unwrap();
        repo
    }

    #[test]
    fn test_cleanup_removes_only_unreferenced() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CollectionFactory::new(Arc::new(Database::in_memory().unwrap()));
        let pool = PackagePool::new(dir.path().join("pool"));

        let kept = import(&factory, &pool, dir.path(), "kept", &[("hello", "1.0")]);
        let snapped = import(&factory, &pool, dir.path(), "snapped", &[("world", "1.0")]);
        let gone = import(&factory, &pool, dir.path(), "gone", &[("old", "1.0")]);

        let snapshot = Snapshot::from_local_repo("snap", &snapped).unwrap();
        factory.snapshots().add(&snapshot).unwrap();
        (*factory.local_repos()).drop(&snapped).unwrap();
        (*factory.local_repos()).drop(&gone).unwrap();
        assert_eq!(pool.filepath_list().unwrap().len(), 3);

        let dry = cleanup_database(&factory, &pool, true, &Output::new()).unwrap();
        assert_eq!(dry.packages_removed, 1);
        assert_eq!(dry.files_removed, 1);
        assert!(dry.bytes_freed > 0);
        assert_eq!(pool.filepath_list().unwrap().len(), 3);

        let report = cleanup_database(&factory, &pool, false, &Output::new()).unwrap();
        assert_eq!(report.packages_removed, 1);
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.bytes_freed, dry.bytes_freed);

        let remaining = factory.packages().all_refs().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| r.name() != "old"));
        for reference in kept.loaded_refs().unwrap() {
            let package = factory.packages().by_key(reference).unwrap();
            assert!(pool.full_path(&package.files[0].pool_path).is_file());
        }
        assert_eq!(pool.filepath_list().unwrap().len(), 2);

        let again = cleanup_database(&factory, &pool, false, &Output::new()).unwrap();
        assert_eq!(again.packages_removed, 0);
        assert_eq!(again.files_removed, 0);
    }

    #[test]
    fn test_shared_file_survives() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CollectionFactory::new(Arc::new(Database::in_memory().unwrap()));
        let pool = PackagePool::new(dir.path().join("pool"));

        // Same package content imported into two repos shares one pool file
        let first = import(&factory, &pool, dir.path(), "shared", &[("hello", "1.0")]);
        let incoming = dir.path().join("in-shared");
        let mut list = PackageRefList::new();
        import_packages(
            &collect_package_files(&[incoming]).unwrap(),
            &mut list,
            false,
            &pool,
            &factory.checksums(),
            &factory.packages(),
            &Output::new(),
        )
        .unwrap();
        let mut second = LocalRepo::new("second", "").unwrap();
        second.update_ref_list(list);
        factory.local_repos().add(&second).unwrap();

        (*factory.local_repos()).drop(&first).unwrap();
        let report = cleanup_database(&factory, &pool, false, &Output::new()).unwrap();
        assert_eq!(report.packages_removed, 0);
        assert_eq!(report.files_removed, 0);
        assert_eq!(pool.filepath_list().unwrap().len(), 1);
    }
}
