// tests/integration_test.rs

//! Integration tests for debpool
//!
//! These tests verify end-to-end functionality across modules.

use debpool::context::PublishRequest;
use debpool::publish::SourceKind;
use debpool::repository::parsers::debian::parse_packages;
use debpool::signer::{OpenPgpVerifier, Provider, SigningOptions, Verifier};
use debpool::task::{List, Output, ProcessReturnValue, TaskState};
use debpool::{Config, Context, Error, db};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Write a minimal but valid `.deb` into `dir`
fn build_deb(dir: &Path, name: &str, version: &str, arch: &str) -> PathBuf {
    let control = format!(
        "Package: {}\nVersion: {}\nArchitecture: {}\nMaintainer: Test <test@example.com>\nSection: utils\nDescription: {} for tests\n",
        name, version, arch, name
    );
    let control_tar = tar_gz(&[("./control", control.as_bytes())]);
    let binary = format!("./usr/bin/{}", name);
    let data_tar = tar_gz(&[(binary.as_str(), name.as_bytes())]);

    fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("{}_{}_{}.deb", name, version, arch));
    let mut builder = ar::Builder::new(File::create(&path).unwrap());
    let members: [(&str, &[u8]); 3] = [
        ("debian-binary", b"2.0\n"),
        ("control.tar.gz", &control_tar),
        ("data.tar.gz", &data_tar),
    ];
    for (member, data) in members {
        let header = ar::Header::new(member.as_bytes().to_vec(), data.len() as u64);
        builder.append(&header, data).unwrap();
    }
    path
}

fn context(root: &Path) -> Context {
    let mut config = Config::with_root(root);
    config.architectures = vec!["amd64".to_string()];
    Context::new(config).unwrap()
}

/// Local repo `name` holding freshly built amd64 packages
fn local_repo(ctx: &Context, root: &Path, name: &str, packages: &[(&str, &str)]) {
    let incoming = root.join("incoming").join(name);
    for (package, version) in packages {
        build_deb(&incoming, package, version, "amd64");
    }
    ctx.create_local_repo(name, "", "", "").unwrap();
    let result = ctx
        .add_packages(name, &[incoming], false, &Output::new())
        .unwrap();
    assert_eq!(result.added.len(), packages.len(), "{:?}", result.failed);
}

fn request(kind: SourceKind, source: &str, prefix: &str, distribution: &str) -> PublishRequest {
    PublishRequest {
        source_kind: Some(kind),
        components: vec![("main".to_string(), source.to_string())],
        prefix: prefix.to_string(),
        distribution: distribution.to_string(),
        ..Default::default()
    }
}

/// Pool paths listed in a published `Packages` index, relative to the public root
fn indexed_files(public: &Path, prefix: &str, distribution: &str) -> Vec<String> {
    let index = public
        .join(prefix)
        .join("dists")
        .join(distribution)
        .join("main/binary-amd64/Packages");
    parse_packages(&fs::read_to_string(index).unwrap())
        .unwrap()
        .into_iter()
        .map(|package| format!("{}/{}", prefix, package.files[0].download_path))
        .collect()
}

#[test]
fn test_database_lifecycle() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("nested/path/to/debpool.db");

    db::init(&db_path).unwrap();
    assert!(db_path.exists(), "Database file should exist after initialization");

    let database = db::open(&db_path).unwrap();
    database.put(b"Ltest", b"{}").unwrap();
    assert_eq!(database.get(b"Ltest").unwrap(), Some(b"{}".to_vec()));

    // Initializing again keeps existing data
    db::init(&db_path).unwrap();
    let database = db::open(&db_path).unwrap();
    assert!(database.get(b"Ltest").unwrap().is_some());
}

#[test]
fn test_snapshot_publish_and_query() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path());
    local_repo(&ctx, dir.path(), "main", &[("hello", "2.10-2")]);
    let snapshot = ctx.snapshot_local_repo("main-1", "main").unwrap();
    assert_eq!(snapshot.num_packages(), 1);

    let report = ctx
        .publish(&request(SourceKind::Snapshot, "main-1", ".", "stable"), &Output::new())
        .unwrap();
    assert_eq!(report.linked, 1);

    let published = ctx.published_repos().unwrap();
    assert_eq!(published.len(), 1);
    let refs: Vec<String> = published[0].refs["main"].iter().map(|r| r.to_string()).collect();
    let expected: Vec<String> = snapshot.loaded_refs().unwrap().iter().map(|r| r.to_string()).collect();
    assert_eq!(refs, expected);

    let public = ctx.config().public_dir();
    assert!(public.join("dists/stable/Release").is_file());
    assert!(!public.join("dists/stable/InRelease").exists());
    for file in indexed_files(&public, ".", "stable") {
        assert!(public.join(&file).is_file(), "{} is not in the public pool", file);
    }
}

#[test]
fn test_concurrent_publishes_share_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Arc::new(context(dir.path()));
    local_repo(&ctx, dir.path(), "one", &[("alpha", "1.0"), ("beta", "1.0")]);
    local_repo(&ctx, dir.path(), "two", &[("gamma", "1.0"), ("delta", "1.0")]);

    let tasks = List::new().unwrap();
    let mut ids = Vec::new();
    for (repo, distribution) in [("one", "stable"), ("two", "testing")] {
        let request = request(SourceKind::Local, repo, "debian", distribution);
        let resources = ctx.publish_resources(&request).unwrap();
        let ctx = Arc::clone(&ctx);
        let task = tasks
            .run_task_in_background(&format!("publish {}", repo), resources, move |out, _| {
                let report = ctx.publish(&request, out)?;
                Ok(ProcessReturnValue::ok(serde_json::to_value(report)?))
            })
            .unwrap();
        ids.push(task.id);
    }
    tasks.wait();

    for id in ids {
        let task = tasks.get_task_by_id(id).unwrap();
        assert_eq!(
            task.state,
            TaskState::Succeeded,
            "{}",
            tasks.get_task_output_by_id(id).unwrap()
        );
    }

    let public = ctx.config().public_dir();
    let stable = indexed_files(&public, "debian", "stable");
    let testing = indexed_files(&public, "debian", "testing");
    assert_eq!(stable.len(), 2);
    assert_eq!(testing.len(), 2);
    for file in stable.iter().chain(&testing) {
        assert!(public.join(file).is_file(), "{} was removed", file);
    }
    tasks.stop();
}

#[test]
fn test_import_twice_shares_pool_file() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path());
    let incoming = dir.path().join("incoming");
    build_deb(&incoming, "hello", "1.0", "amd64");

    ctx.create_local_repo("first", "", "", "").unwrap();
    ctx.create_local_repo("second", "", "", "").unwrap();
    ctx.add_packages("first", &[incoming.clone()], false, &Output::new())
        .unwrap();
    ctx.add_packages("second", &[incoming], false, &Output::new())
        .unwrap();

    let first = ctx.local_repo_packages("first").unwrap();
    let second = ctx.local_repo_packages("second").unwrap();
    assert_eq!(first, second);
    assert_eq!(first[0].files[0].pool_path, second[0].files[0].pool_path);
    assert_eq!(ctx.pool().filepath_list().unwrap().len(), 1);
}

#[test]
fn test_cleanup_keeps_files_of_other_distribution() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path());
    let output = Output::new();
    local_repo(&ctx, dir.path(), "main", &[("hello", "1.0")]);
    ctx.snapshot_local_repo("frozen", "main").unwrap();

    ctx.publish(&request(SourceKind::Local, "main", ".", "unstable"), &output)
        .unwrap();
    ctx.publish(&request(SourceKind::Snapshot, "frozen", ".", "stable"), &output)
        .unwrap();

    let public = ctx.config().public_dir();
    let file = public.join("pool/main/h/hello/hello_1.0_amd64.deb");
    let report = ctx.drop_published("", ".", "unstable", false, &output).unwrap();
    assert_eq!(report.removed_files, 0);
    assert!(file.is_file());

    // The snapshot still references the package, so nothing is collected
    ctx.drop_local_repo("main", true).unwrap();
    let cleanup = ctx.cleanup(false, &output).unwrap();
    assert_eq!(cleanup.packages_removed, 0);
    assert_eq!(cleanup.files_removed, 0);
    assert_eq!(ctx.pool().filepath_list().unwrap().len(), 1);

    ctx.drop_published("", ".", "stable", false, &output).unwrap();
    assert!(!file.exists());
    ctx.drop_snapshot("frozen", false).unwrap();
    let cleanup = ctx.cleanup(false, &output).unwrap();
    assert_eq!(cleanup.packages_removed, 1);
    assert_eq!(cleanup.files_removed, 1);
    assert!(ctx.pool().filepath_list().unwrap().is_empty());
}

#[test]
fn test_signed_publish_with_internal_provider() {
    use sequoia_openpgp::cert::CertBuilder;
    use sequoia_openpgp::serialize::Serialize;

    let dir = tempfile::tempdir().unwrap();
    let (cert, _) = CertBuilder::general_purpose(None, Some("repo@example.com"))
        .generate()
        .unwrap();
    let secret = dir.path().join("secret.key");
    let mut buf = Vec::new();
    cert.as_tsk().serialize(&mut buf).unwrap();
    fs::write(&secret, buf).unwrap();
    let public_key = dir.path().join("public.key");
    let mut buf = Vec::new();
    cert.serialize(&mut buf).unwrap();
    fs::write(&public_key, buf).unwrap();

    let mut config = Config::with_root(dir.path().join("root"));
    config.gpg_provider = Provider::Internal;
    let ctx = Context::new(config).unwrap();
    local_repo(&ctx, dir.path(), "main", &[("hello", "1.0")]);

    let mut publish = request(SourceKind::Local, "main", ".", "stable");
    publish.signing = Some(SigningOptions {
        secret_keyring: Some(secret),
        ..Default::default()
    });
    ctx.publish(&publish, &Output::new()).unwrap();

    let dists = ctx.config().public_dir().join("dists/stable");
    let release = fs::read(dists.join("Release")).unwrap();
    let verifier = OpenPgpVerifier::from_keyrings(&[public_key]).unwrap();
    verifier
        .verify_detached_signature(&fs::read(dists.join("Release.gpg")).unwrap(), &release)
        .unwrap();
    let inline = verifier
        .verify_clearsigned(&fs::read(dists.join("InRelease")).unwrap())
        .unwrap();
    assert!(String::from_utf8_lossy(&inline).contains("Suite: stable"));
}

#[test]
fn test_unreadable_keyring_leaves_publish_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::with_root(dir.path().join("root"));
    config.gpg_provider = Provider::Internal;
    config.architectures = vec!["amd64".to_string()];
    let ctx = Context::new(config).unwrap();
    local_repo(&ctx, dir.path(), "main", &[("hello", "1.0")]);

    ctx.publish(&request(SourceKind::Local, "main", ".", "stable"), &Output::new())
        .unwrap();
    let release = ctx.config().public_dir().join("dists/stable/Release");
    let before = fs::read(&release).unwrap();

    let mut failing = request(SourceKind::Local, "main", ".", "stable");
    failing.signing = Some(SigningOptions {
        secret_keyring: Some(dir.path().join("missing.key")),
        ..Default::default()
    });
    let err = ctx
        .update_published("", ".", "stable", &Default::default(), false, false, failing.signing.as_ref(), &Output::new())
        .unwrap_err();
    assert!(matches!(err, Error::Signing(_)), "{}", err);
    assert_eq!(fs::read(&release).unwrap(), before);
}

#[test]
fn test_task_end_to_end() {
    let tasks = List::new().unwrap();

    let task = tasks
        .run_task_and_wait("A", vec!["L:repo1".to_string()], |out, _| {
            out.print("done");
            Ok(ProcessReturnValue::ok(serde_json::Value::Null))
        })
        .unwrap();
    assert_eq!(task.state, TaskState::Succeeded);
    assert_eq!(tasks.get_task_output_by_id(task.id).unwrap(), "done");
    tasks.delete_task_by_id(task.id).unwrap();
    assert!(matches!(tasks.get_task_by_id(task.id), Err(Error::NotFound(_))));

    let (release, gate) = crossbeam::channel::bounded::<()>(0);
    let running = tasks
        .run_task_in_background("B", vec!["L:repo1".to_string()], move |_, _| {
            let _ = gate.recv();
            Ok(ProcessReturnValue::ok(serde_json::Value::Null))
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while tasks.get_task_by_id(running.id).unwrap().state != TaskState::Running {
        assert!(Instant::now() < deadline, "task never started");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(
        tasks.delete_task_by_id(running.id),
        Err(Error::Conflict(_))
    ));

    release.send(()).unwrap();
    let finished = tasks.wait_for_task_by_id(running.id).unwrap();
    assert_eq!(finished.state, TaskState::Succeeded);
    tasks.stop();
}
