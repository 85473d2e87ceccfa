// src/config.rs

//! Configuration file
//!
//! A JSON document looked up at `--config`, then `~/.debpool.conf`, then
//! `/etc/debpool.conf`. Missing fields take their defaults, so an empty
//! object is a valid configuration.

use crate::error::{Error, Result};
use crate::pool::LinkMethod;
use crate::signer::Provider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const USER_CONFIG: &str = ".debpool.conf";
const SYSTEM_CONFIG: &str = "/etc/debpool.conf";

/// Additional public directory, addressed as `filesystem:<name>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystemEndpoint {
    pub root_dir: PathBuf,
    #[serde(default)]
    pub link_method: LinkMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub root_dir: PathBuf,
    /// Defaults to `<root_dir>/db/debpool.db`
    pub database_path: Option<PathBuf>,
    /// Defaults to `<root_dir>/pool`
    pub pool_dir: Option<PathBuf>,
    /// Defaults to `<root_dir>/public`
    pub public_dir: Option<PathBuf>,
    /// Architectures mirrored and published when none are given
    pub architectures: Vec<String>,
    pub download_concurrency: usize,
    pub gpg_disable_sign: bool,
    pub gpg_disable_verify: bool,
    pub gpg_provider: Provider,
    /// Trusted keyrings for mirror verification
    pub gpg_keyrings: Vec<PathBuf>,
    pub skip_contents_publishing: bool,
    pub link_method: LinkMethod,
    pub filesystem_publish_endpoints: BTreeMap<String, FileSystemEndpoint>,
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".debpool"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/debpool"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root(),
            database_path: None,
            pool_dir: None,
            public_dir: None,
            architectures: Vec::new(),
            download_concurrency: 4,
            gpg_disable_sign: false,
            gpg_disable_verify: false,
            gpg_provider: Provider::default(),
            gpg_keyrings: Vec::new(),
            skip_contents_publishing: false,
            link_method: LinkMethod::default(),
            filesystem_publish_endpoints: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load from `explicit`, else the first existing default location
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        let candidates = dirs::home_dir()
            .map(|home| home.join(USER_CONFIG))
            .into_iter()
            .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG)));
        for path in candidates {
            if path.is_file() {
                return Self::load_from(&path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Validation(format!("unable to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::Validation(format!("invalid config {}: {}", path.display(), e))
        })?;
        debug!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(Error::Validation("root_dir must not be empty".to_string()));
        }
        if self.download_concurrency == 0 {
            return Err(Error::Validation(
                "download_concurrency must be at least 1".to_string(),
            ));
        }
        for (name, endpoint) in &self.filesystem_publish_endpoints {
            if name.is_empty() || endpoint.root_dir.as_os_str().is_empty() {
                return Err(Error::Validation(format!(
                    "filesystem endpoint {:?} needs a name and a root_dir",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.root_dir.join("db").join("debpool.db"))
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.pool_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("pool"))
    }

    pub fn public_dir(&self) -> PathBuf {
        self.public_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("public"))
    }

    /// Config rooted at `root` with every other field defaulted
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.download_concurrency, 4);
        assert_eq!(config.gpg_provider, Provider::Gpg);
        assert_eq!(config.link_method, LinkMethod::Hardlink);
        config.validate().unwrap();
    }

    #[test]
    fn test_derived_paths() {
        let config = Config::with_root("/srv/debpool");
        assert_eq!(config.database_path(), PathBuf::from("/srv/debpool/db/debpool.db"));
        assert_eq!(config.pool_dir(), PathBuf::from("/srv/debpool/pool"));
        assert_eq!(config.public_dir(), PathBuf::from("/srv/debpool/public"));

        let config = Config {
            public_dir: Some(PathBuf::from("/var/www/apt")),
            ..config
        };
        assert_eq!(config.public_dir(), PathBuf::from("/var/www/apt"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debpool.conf");
        fs::write(
            &path,
            r#"{
                "root_dir": "/srv/debpool",
                "gpg_provider": "internal",
                "link_method": "copy",
                "architectures": ["amd64", "arm64"],
                "filesystem_publish_endpoints": {
                    "web": {"root_dir": "/var/www/apt", "link_method": "symlink"}
                }
            }"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.gpg_provider, Provider::Internal);
        assert_eq!(config.link_method, LinkMethod::Copy);
        assert_eq!(config.architectures, vec!["amd64", "arm64"]);
        assert_eq!(
            config.filesystem_publish_endpoints["web"].link_method,
            LinkMethod::Symlink
        );

        let saved = dir.path().join("copy.conf");
        config.save_to(&saved).unwrap();
        assert_eq!(Config::load_from(&saved).unwrap(), config);
    }

    #[test]
    fn test_invalid_configs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.conf");

        fs::write(&path, r#"{"download_concurrency": 0}"#).unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Validation(_))));

        fs::write(&path, r#"{"root_dir": ""}"#).unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Validation(_))));

        fs::write(&path, r#"{"gpg_provider": "pgp"}"#).unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Validation(_))));

        assert!(matches!(
            Config::load(Some(&dir.path().join("missing.conf"))),
            Err(Error::Validation(_))
        ));
    }
}
