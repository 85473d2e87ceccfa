// src/main.rs

use anyhow::{Result, anyhow, bail};
use clap::{CommandFactory, Parser};
use debpool::context::{LocalRepoEdit, PublishRequest, local_repos_resource};
use debpool::publish::SourceKind;
use debpool::signer::SigningOptions;
use debpool::task::{
    ALL_RESOURCES_KEY, Detail, List, Output, ProcessReturnValue, TaskProgress, TaskState,
};
use debpool::{Config, Context};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tracing::info;

mod cli;

use cli::{
    Cli, Commands, DbCommands, MirrorCommands, PublishArgs, PublishCommands, RepoCommands,
    SigningArgs, SnapshotCommands,
};

impl SigningArgs {
    fn options(&self) -> Option<SigningOptions> {
        if self.skip_signing {
            return None;
        }
        Some(SigningOptions {
            key: self.gpg_key.clone(),
            keyring: self.keyring.clone(),
            secret_keyring: self.secret_keyring.clone(),
            passphrase: self.passphrase.clone(),
            passphrase_file: self.passphrase_file.clone(),
            batch: self.batch,
        })
    }
}

/// Run `process` as a task, print its output and return its value
fn run_task<F>(tasks: &List, name: &str, resources: Vec<String>, process: F) -> Result<()>
where
    F: FnOnce(&Output, &Detail) -> debpool::Result<ProcessReturnValue> + Send + 'static,
{
    let task = tasks.run_task_and_wait(name, resources, process)?;
    print!("{}", tasks.get_task_output_by_id(task.id)?);

    if task.state != TaskState::Succeeded {
        let error = tasks
            .get_task_error_by_id(task.id)?
            .unwrap_or_else(|| format!("task ended in state {}", task.state));
        bail!(error);
    }
    if let Some(value) = tasks.get_task_return_value_by_id(task.id)? {
        if !value.value.is_null() {
            println!("{}", serde_json::to_string_pretty(&value.value)?);
        }
    }
    Ok(())
}

fn ok_value<T: serde::Serialize>(value: &T) -> debpool::Result<ProcessReturnValue> {
    Ok(ProcessReturnValue::ok(serde_json::to_value(value)?))
}

fn parse_switch(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut switch = BTreeMap::new();
    for entry in raw {
        let (component, snapshot) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid switch {:?}, expected component=snapshot", entry))?;
        switch.insert(component.to_string(), snapshot.to_string());
    }
    Ok(switch)
}

fn publish_request(kind: SourceKind, args: &PublishArgs) -> Result<PublishRequest> {
    let components = if args.component.is_empty() && args.sources.len() == 1 {
        vec!["main".to_string()]
    } else {
        args.component.clone()
    };
    if components.len() != args.sources.len() {
        bail!(
            "mismatch in number of components ({}) and sources ({})",
            components.len(),
            args.sources.len()
        );
    }

    Ok(PublishRequest {
        source_kind: Some(kind),
        components: components.into_iter().zip(args.sources.iter().cloned()).collect(),
        storage: args.storage.clone(),
        prefix: args.prefix.clone(),
        distribution: args.distribution.clone(),
        architectures: args.architectures.clone(),
        origin: args.origin.clone(),
        label: args.label.clone(),
        force_overwrite: args.force_overwrite,
        skip_contents: args.skip_contents,
        skip_cleanup: args.skip_cleanup,
        signing: args.signing.options(),
    })
}

fn repo_command(ctx: Arc<Context>, tasks: &List, command: RepoCommands) -> Result<()> {
    match command {
        RepoCommands::Create {
            name,
            comment,
            distribution,
            component,
        } => {
            let task_name = format!("Create local repo {}", name);
            run_task(tasks, &task_name, local_repos_resource(), move |out, _| {
                ctx.create_local_repo(&name, &comment, &distribution, &component)?;
                out.print(&format!("Local repo {} successfully added.\n", name));
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
        RepoCommands::List => {
            let repos = ctx.factory().local_repos().list()?;
            if repos.is_empty() {
                println!("No local repositories found.");
                return Ok(());
            }
            println!("List of local repos:");
            for repo in &repos {
                println!(" * {}{}", repo.name, if repo.comment.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", repo.comment)
                });
            }
            println!("\nTotal: {} repo(s)", repos.len());
            Ok(())
        }
        RepoCommands::Show {
            name,
            with_packages,
        } => {
            let repo = ctx.local_repo(&name)?;
            println!("Name: {}", repo.name);
            println!("Comment: {}", repo.comment);
            println!("Default Distribution: {}", repo.default_distribution);
            println!("Default Component: {}", repo.default_component);
            println!("Number of packages: {}", repo.num_packages());
            if with_packages {
                println!("Packages:");
                for reference in repo.loaded_refs()? {
                    println!("  {}", reference);
                }
            }
            Ok(())
        }
        RepoCommands::Edit {
            name,
            new_name,
            comment,
            distribution,
            component,
        } => {
            let resource = ctx.factory().local_repos().by_name(&name)?.resource_key();
            let edit = LocalRepoEdit {
                name: new_name,
                comment,
                default_distribution: distribution,
                default_component: component,
            };
            run_task(tasks, &format!("Edit local repo {}", name), vec![resource], move |out, _| {
                let repo = ctx.edit_local_repo(&name, &edit)?;
                out.print(&format!("Local repo {} successfully updated.\n", repo.name));
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
        RepoCommands::Drop { name, force } => {
            let resource = ctx.factory().local_repos().by_name(&name)?.resource_key();
            run_task(tasks, &format!("Delete local repo {}", name), vec![resource], move |out, _| {
                ctx.drop_local_repo(&name, force)?;
                out.print(&format!("Local repo {} has been removed.\n", name));
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
        RepoCommands::Add {
            name,
            paths,
            force_replace,
        } => {
            let resource = ctx.factory().local_repos().by_name(&name)?.resource_key();
            run_task(tasks, &format!("Add packages to local repo {}", name), vec![resource], move |out, detail| {
                let progress = TaskProgress::new(out, detail);
                let result = ctx.add_packages(&name, &paths, force_replace, &progress)?;
                ok_value(&result)
            })
        }
        RepoCommands::Remove { name, refs } => {
            let resource = ctx.factory().local_repos().by_name(&name)?.resource_key();
            run_task(tasks, &format!("Remove packages from local repo {}", name), vec![resource], move |out, detail| {
                let progress = TaskProgress::new(out, detail);
                ctx.remove_packages(&name, &refs, &progress)?;
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
        RepoCommands::Copy {
            source,
            destination,
            packages,
        } => {
            let resources = {
                let repos = ctx.factory().local_repos();
                vec![
                    repos.by_name(&source)?.resource_key(),
                    repos.by_name(&destination)?.resource_key(),
                ]
            };
            let task_name = format!("Copy packages from {} to {}", source, destination);
            run_task(tasks, &task_name, resources, move |out, detail| {
                let progress = TaskProgress::new(out, detail);
                ctx.copy_packages(&source, &destination, &packages, &progress)?;
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
        RepoCommands::Packages { name } => {
            for package in ctx.local_repo_packages(&name)? {
                println!("{}", package.reference());
            }
            Ok(())
        }
    }
}

fn mirror_command(ctx: Arc<Context>, tasks: &List, command: MirrorCommands) -> Result<()> {
    match command {
        MirrorCommands::Create {
            name,
            url,
            distribution,
            components,
            architectures,
        } => {
            let repo = ctx.create_mirror(&name, &url, &distribution, components, architectures)?;
            println!(
                "Mirror {} successfully added.\nYou can run 'debpool mirror update {}' to download repository contents.",
                repo.name, repo.name
            );
            Ok(())
        }
        MirrorCommands::Update { name } => {
            let resource = ctx.factory().remote_repos().by_name(&name)?.resource_key();
            run_task(tasks, &format!("Update mirror {}", name), vec![resource], move |out, detail| {
                let progress = TaskProgress::new(out, detail);
                let result = ctx.update_mirror(&name, &progress)?;
                ok_value(&result)
            })
        }
        MirrorCommands::List => {
            let repos = ctx.factory().remote_repos().list()?;
            if repos.is_empty() {
                println!("No mirrors found.");
                return Ok(());
            }
            println!("List of mirrors:");
            for repo in &repos {
                println!(" * {} [{}]: {} {}", repo.name, repo.uuid, repo.archive_root, repo.distribution);
            }
            Ok(())
        }
        MirrorCommands::Drop { name, force } => {
            let resource = ctx.factory().remote_repos().by_name(&name)?.resource_key();
            run_task(tasks, &format!("Delete mirror {}", name), vec![resource], move |out, _| {
                ctx.drop_mirror(&name, force)?;
                out.print(&format!("Mirror {} has been removed.\n", name));
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
    }
}

fn snapshot_command(ctx: Arc<Context>, tasks: &List, command: SnapshotCommands) -> Result<()> {
    match command {
        SnapshotCommands::Create { name, repo, mirror } => {
            let (resource, task_name) = match (&repo, &mirror) {
                (Some(repo), _) => (
                    ctx.factory().local_repos().by_name(repo)?.resource_key(),
                    format!("Create snapshot {} of local repo {}", name, repo),
                ),
                (None, Some(mirror)) => (
                    ctx.factory().remote_repos().by_name(mirror)?.resource_key(),
                    format!("Create snapshot {} of mirror {}", name, mirror),
                ),
                (None, None) => bail!("either --repo or --mirror is required"),
            };
            run_task(tasks, &task_name, vec![resource], move |out, _| {
                let snapshot = match repo {
                    Some(repo) => ctx.snapshot_local_repo(&name, &repo)?,
                    None => ctx.snapshot_mirror(&name, mirror.as_deref().unwrap_or_default())?,
                };
                out.print(&format!(
                    "Snapshot {} successfully created with {} packages.\n",
                    snapshot.name,
                    snapshot.num_packages()
                ));
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
        SnapshotCommands::Merge {
            destination,
            sources,
            latest,
        } => {
            let resources = {
                let snapshots = ctx.factory().snapshots();
                sources
                    .iter()
                    .map(|name| snapshots.by_name(name).map(|s| s.resource_key()))
                    .collect::<debpool::Result<Vec<_>>>()?
            };
            run_task(tasks, &format!("Merge snapshot {}", destination), resources, move |out, _| {
                let snapshot = ctx.merge_snapshots(&destination, &sources, latest)?;
                out.print(&format!(
                    "Snapshot {} successfully created with {} packages.\n",
                    snapshot.name,
                    snapshot.num_packages()
                ));
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
        SnapshotCommands::Diff {
            left,
            right,
            only_matching,
        } => {
            let diff = ctx.diff_snapshots(&left, &right, only_matching)?;
            if diff.is_empty() {
                println!("Snapshots are identical.");
                return Ok(());
            }
            println!("  Arch   | Package                        | Version in A      | Version in B");
            for entry in diff {
                let sample = entry.left.as_ref().or(entry.right.as_ref());
                let (arch, name) = sample
                    .map(|p| (p.architecture.clone(), p.name.clone()))
                    .unwrap_or_default();
                let version = |p: &Option<debpool::packages::Package>| {
                    p.as_ref().map_or("-".to_string(), |p| p.version.clone())
                };
                let marker = match (&entry.left, &entry.right) {
                    (Some(_), None) => '-',
                    (None, Some(_)) => '+',
                    _ => '!',
                };
                println!(
                    "{} {:<6} | {:<30} | {:<17} | {}",
                    marker,
                    arch,
                    name,
                    version(&entry.left),
                    version(&entry.right)
                );
            }
            Ok(())
        }
        SnapshotCommands::List => {
            let snapshots = ctx.factory().snapshots().list()?;
            if snapshots.is_empty() {
                println!("No snapshots found.");
                return Ok(());
            }
            println!("List of snapshots:");
            for snapshot in &snapshots {
                println!(" * [{}]: {}", snapshot.name, snapshot.description);
            }
            Ok(())
        }
        SnapshotCommands::Show { name } => {
            let snapshot = ctx.snapshot(&name)?;
            println!("Name: {}", snapshot.name);
            println!("Created At: {}", snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("Description: {}", snapshot.description);
            println!("Number of packages: {}", snapshot.num_packages());
            println!("Packages:");
            for reference in snapshot.loaded_refs()? {
                println!("  {}", reference);
            }
            Ok(())
        }
        SnapshotCommands::Rename {
            name,
            new_name,
            description,
        } => {
            let resource = ctx.factory().snapshots().by_name(&name)?.resource_key();
            run_task(tasks, &format!("Update snapshot {}", name), vec![resource], move |out, _| {
                let snapshot = ctx.rename_snapshot(&name, &new_name, description.as_deref())?;
                out.print(&format!("Snapshot {} -> {} has been updated.\n", name, snapshot.name));
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
        SnapshotCommands::Drop { name, force } => {
            let resource = ctx.factory().snapshots().by_name(&name)?.resource_key();
            run_task(tasks, &format!("Delete snapshot {}", name), vec![resource], move |out, _| {
                ctx.drop_snapshot(&name, force)?;
                out.print(&format!("Snapshot {} has been dropped.\n", name));
                Ok(ProcessReturnValue::ok(serde_json::Value::Null))
            })
        }
    }
}

fn publish_command(ctx: Arc<Context>, tasks: &List, command: PublishCommands) -> Result<()> {
    match command {
        PublishCommands::Repo(args) => publish(ctx, tasks, SourceKind::Local, &args),
        PublishCommands::Snapshot(args) => publish(ctx, tasks, SourceKind::Snapshot, &args),
        PublishCommands::Update {
            distribution,
            prefix,
            storage,
            switch,
            force_overwrite,
            skip_cleanup,
            signing,
        } => {
            let switch = parse_switch(&switch)?;
            let resources = ctx.update_resources(&storage, &prefix, &distribution, &switch)?;
            let signing = signing.options();
            let task_name = format!("Update published repository {}:{}/{}", storage, prefix, distribution);
            run_task(tasks, &task_name, resources, move |out, detail| {
                let progress = TaskProgress::new(out, detail);
                let report = ctx.update_published(
                    &storage,
                    &prefix,
                    &distribution,
                    &switch,
                    force_overwrite,
                    skip_cleanup,
                    signing.as_ref(),
                    &progress,
                )?;
                ok_value(&report)
            })
        }
        PublishCommands::Drop {
            distribution,
            prefix,
            storage,
            skip_cleanup,
        } => {
            let resources = ctx.update_resources(&storage, &prefix, &distribution, &BTreeMap::new())?;
            let task_name = format!("Delete published repository {}:{}/{}", storage, prefix, distribution);
            run_task(tasks, &task_name, resources, move |out, detail| {
                let progress = TaskProgress::new(out, detail);
                let report = ctx.drop_published(&storage, &prefix, &distribution, skip_cleanup, &progress)?;
                ok_value(&report)
            })
        }
        PublishCommands::List => {
            let repos = ctx.published_repos()?;
            if repos.is_empty() {
                println!("No snapshots/local repos have been published.");
                return Ok(());
            }
            println!("Published repositories:");
            for repo in &repos {
                let sources: Vec<String> = repo
                    .sources
                    .keys()
                    .map(|component| format!("{}: {} packages", component, repo.refs.get(component).map_or(0, |r| r.len())))
                    .collect();
                println!(
                    "  * {} [{}] publishes {} ({})",
                    repo,
                    repo.architectures.join(", "),
                    repo.source_kind,
                    sources.join(", ")
                );
            }
            Ok(())
        }
    }
}

fn publish(ctx: Arc<Context>, tasks: &List, kind: SourceKind, args: &PublishArgs) -> Result<()> {
    let request = publish_request(kind, args)?;
    let resources = ctx.publish_resources(&request)?;
    let task_name = format!(
        "Publish {} {} as {}/{}",
        kind,
        args.sources.join(", "),
        request.prefix,
        request.distribution
    );
    run_task(tasks, &task_name, resources, move |out, detail| {
        let progress = TaskProgress::new(out, detail);
        let report = ctx.publish(&request, &progress)?;
        ok_value(&report)
    })
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        println!("debpool v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'debpool --help' for usage information");
        return Ok(());
    };

    if let Commands::Completions { shell } = command {
        clap_complete::generate(shell, &mut Cli::command(), "debpool", &mut io::stdout());
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    let ctx = Arc::new(Context::new(config)?);
    let tasks = List::new()?;

    let result = match command {
        Commands::Init => {
            info!("Initialized debpool at {}", ctx.config().root_dir.display());
            println!(
                "Database initialized successfully at: {}",
                ctx.config().database_path().display()
            );
            Ok(())
        }
        Commands::Repo(command) => repo_command(ctx, &tasks, command),
        Commands::Mirror(command) => mirror_command(ctx, &tasks, command),
        Commands::Snapshot(command) => snapshot_command(ctx, &tasks, command),
        Commands::Publish(command) => publish_command(ctx, &tasks, command),
        Commands::Db(DbCommands::Cleanup { dry_run }) => run_task(
            &tasks,
            "Clean up database",
            vec![ALL_RESOURCES_KEY.to_string()],
            move |out, detail| {
                let progress = TaskProgress::new(out, detail);
                let report = ctx.cleanup(dry_run, &progress)?;
                ok_value(&report)
            },
        ),
        Commands::Completions { .. } => Ok(()),
    };

    tasks.stop();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_subcommand_options() {
        let cli = Cli::parse_from(["debpool", "snapshot", "create", "snap", "--mirror", "bookworm"]);
        let Some(Commands::Snapshot(SnapshotCommands::Create { repo, mirror, .. })) = cli.command else {
            panic!("unexpected command");
        };
        assert_eq!((repo, mirror.as_deref()), (None, Some("bookworm")));
        assert!(Cli::try_parse_from(["debpool", "snapshot", "create", "snap"]).is_err());

        let cli = Cli::parse_from([
            "debpool", "publish", "drop", "stable", "--prefix", "debian", "--storage", "filesystem:web",
        ]);
        let Some(Commands::Publish(PublishCommands::Drop { prefix, storage, .. })) = cli.command else {
            panic!("unexpected command");
        };
        assert_eq!((prefix.as_str(), storage.as_str()), ("debian", "filesystem:web"));

        let cli = Cli::parse_from([
            "debpool", "publish", "update", "stable", "--prefix", "debian", "--switch", "main=snap",
        ]);
        let Some(Commands::Publish(PublishCommands::Update { prefix, switch, .. })) = cli.command else {
            panic!("unexpected command");
        };
        assert_eq!(prefix, "debian");
        assert_eq!(switch, vec!["main=snap"]);
    }

    #[test]
    fn test_parse_switch() {
        let switch = parse_switch(&["main=release-2".to_string()]).unwrap();
        assert_eq!(switch["main"], "release-2");
        assert!(parse_switch(&["main".to_string()]).is_err());
    }

    #[test]
    fn test_publish_components() {
        let cli = Cli::parse_from([
            "debpool", "publish", "snapshot", "base", "extras", "-d", "stable",
            "--component", "main,contrib", "--skip-signing",
        ]);
        let Some(Commands::Publish(PublishCommands::Snapshot(args))) = cli.command else {
            panic!("unexpected command");
        };
        let request = publish_request(SourceKind::Snapshot, &args).unwrap();
        assert_eq!(
            request.components,
            vec![
                ("main".to_string(), "base".to_string()),
                ("contrib".to_string(), "extras".to_string())
            ]
        );
        assert!(request.signing.is_none());

        let cli = Cli::parse_from(["debpool", "publish", "repo", "a", "b", "-d", "stable"]);
        let Some(Commands::Publish(PublishCommands::Repo(args))) = cli.command else {
            panic!("unexpected command");
        };
        assert!(publish_request(SourceKind::Local, &args).is_err());
    }
}
