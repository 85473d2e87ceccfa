// src/cli.rs

//! Command line definition, shared with the man page generator in build.rs

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "debpool")]
#[command(author, version, about = "Debian repository manager with snapshots and signed publishing", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.debpool.conf, then /etc/debpool.conf)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and directories
    Init,
    /// Manage local repositories
    #[command(subcommand)]
    Repo(RepoCommands),
    /// Manage mirrors of remote archives
    #[command(subcommand)]
    Mirror(MirrorCommands),
    /// Manage snapshots
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
    /// Publish local repos and snapshots
    #[command(subcommand)]
    Publish(PublishCommands),
    /// Database maintenance
    #[command(subcommand)]
    Db(DbCommands),
    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum RepoCommands {
    /// Create a local repo
    Create {
        name: String,
        #[arg(long, default_value = "")]
        comment: String,
        /// Default distribution when publishing
        #[arg(long, default_value = "")]
        distribution: String,
        /// Default component when publishing
        #[arg(long, default_value = "")]
        component: String,
    },
    /// List local repos
    List,
    /// Show a local repo
    Show {
        name: String,
        /// Also list the packages
        #[arg(long)]
        with_packages: bool,
    },
    /// Change a local repo's name or defaults
    Edit {
        name: String,
        #[arg(long)]
        new_name: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long)]
        distribution: Option<String>,
        #[arg(long)]
        component: Option<String>,
    },
    /// Drop a local repo
    Drop {
        name: String,
        /// Drop even when snapshots were taken from it
        #[arg(short, long)]
        force: bool,
    },
    /// Import .deb files or directories into a local repo
    Add {
        name: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Replace packages with the same name, version and architecture
        #[arg(long)]
        force_replace: bool,
    },
    /// Remove packages by reference
    Remove {
        name: String,
        #[arg(required = true)]
        refs: Vec<String>,
    },
    /// Copy packages by name from one local repo to another
    Copy {
        source: String,
        destination: String,
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// List package references of a local repo
    Packages { name: String },
}

#[derive(Subcommand)]
pub enum MirrorCommands {
    /// Create a mirror of a remote archive
    Create {
        name: String,
        /// Archive root, e.g. http://deb.debian.org/debian/
        url: String,
        distribution: String,
        /// Components to mirror (default: all in Release)
        components: Vec<String>,
        /// Architectures to mirror, comma separated
        #[arg(long, value_delimiter = ',')]
        architectures: Vec<String>,
    },
    /// Download the current state of a mirror
    Update { name: String },
    /// List mirrors
    List,
    /// Drop a mirror
    Drop {
        name: String,
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Snapshot a local repo or a mirror
    Create {
        name: String,
        #[arg(long, conflicts_with = "mirror", required_unless_present = "mirror")]
        repo: Option<String>,
        #[arg(long)]
        mirror: Option<String>,
    },
    /// Merge snapshots into a new one
    Merge {
        destination: String,
        #[arg(required = true)]
        sources: Vec<String>,
        /// Keep only the latest version of each package
        #[arg(long)]
        latest: bool,
    },
    /// Show differences between two snapshots
    Diff {
        left: String,
        right: String,
        #[arg(long)]
        only_matching: bool,
    },
    /// List snapshots
    List,
    /// Show a snapshot's package references
    Show { name: String },
    /// Rename a snapshot or change its description
    Rename {
        name: String,
        new_name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Drop a snapshot
    Drop {
        name: String,
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Clone)]
pub struct SigningArgs {
    /// Publish without Release.gpg and InRelease
    #[arg(long)]
    pub skip_signing: bool,
    /// Key id, fingerprint or user id to sign with
    #[arg(long = "gpg-key")]
    pub gpg_key: Option<String>,
    #[arg(long)]
    pub keyring: Option<PathBuf>,
    #[arg(long)]
    pub secret_keyring: Option<PathBuf>,
    #[arg(long)]
    pub passphrase: Option<String>,
    #[arg(long)]
    pub passphrase_file: Option<PathBuf>,
    /// Never prompt for a passphrase
    #[arg(long)]
    pub batch: bool,
}

#[derive(Args)]
pub struct PublishArgs {
    /// Local repos or snapshots, one per component
    #[arg(required = true)]
    pub sources: Vec<String>,
    #[arg(short, long)]
    pub distribution: String,
    /// Components, comma separated, in the order of the sources
    #[arg(long, value_delimiter = ',')]
    pub component: Vec<String>,
    #[arg(long, default_value = ".")]
    pub prefix: String,
    /// Published storage, e.g. filesystem:web
    #[arg(long, default_value = "")]
    pub storage: String,
    #[arg(long, value_delimiter = ',')]
    pub architectures: Vec<String>,
    #[arg(long, default_value = "")]
    pub origin: String,
    #[arg(long, default_value = "")]
    pub label: String,
    #[arg(long)]
    pub force_overwrite: bool,
    #[arg(long)]
    pub skip_contents: bool,
    #[arg(long)]
    pub skip_cleanup: bool,
    #[command(flatten)]
    pub signing: SigningArgs,
}

#[derive(Subcommand)]
pub enum PublishCommands {
    /// Publish local repos
    Repo(PublishArgs),
    /// Publish snapshots
    Snapshot(PublishArgs),
    /// Re-publish, optionally switching components to other snapshots
    Update {
        distribution: String,
        #[arg(long, default_value = ".")]
        prefix: String,
        #[arg(long, default_value = "")]
        storage: String,
        /// component=snapshot
        #[arg(long)]
        switch: Vec<String>,
        #[arg(long)]
        force_overwrite: bool,
        #[arg(long)]
        skip_cleanup: bool,
        #[command(flatten)]
        signing: SigningArgs,
    },
    /// Remove a published distribution
    Drop {
        distribution: String,
        #[arg(long, default_value = ".")]
        prefix: String,
        #[arg(long, default_value = "")]
        storage: String,
        #[arg(long)]
        skip_cleanup: bool,
    },
    /// List published repos
    List,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Remove unreferenced packages and pool files
    Cleanup {
        /// Only report what would be removed
        #[arg(long)]
        dry_run: bool,
    },
}
