// src/packages/package.rs

//! Binary package model and its reference identity

use crate::error::{Error, Result};
use crate::packages::stanza::Stanza;
use crate::pool::ChecksumInfo;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Fields regenerated for every index and never stored with the package
const FILE_FIELDS: &[&str] = &["Filename", "Size", "MD5sum", "SHA1", "SHA256", "SHA512"];

/// Identity of one package: `P<arch> <name> <version> <files-hash>`
///
/// Ordering is bytewise, so lists sort by architecture, then name, then version
/// text. Two refs are equal only when the package files are identical.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageRef(String);

impl PackageRef {
    pub fn new(architecture: &str, name: &str, version: &str, files_hash: &str) -> Self {
        Self(format!("P{} {} {} {}", architecture, name, version, files_hash))
    }

    /// Parse the textual form, rejecting anything that is not a package ref
    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.starts_with('P')
            && s.len() > 1
            && s.split(' ').count() == 4
            && s.split(' ').all(|part| !part.is_empty());
        if !valid {
            return Err(Error::Validation(format!("invalid package reference: {}", s)));
        }
        Ok(Self(s.to_string()))
    }

    fn part(&self, index: usize) -> &str {
        self.0[1..].split(' ').nth(index).unwrap_or("")
    }

    pub fn architecture(&self) -> &str {
        self.part(0)
    }

    pub fn name(&self) -> &str {
        self.part(1)
    }

    pub fn version(&self) -> &str {
        self.part(2)
    }

    pub fn files_hash(&self) -> &str {
        self.part(3)
    }

    /// Same architecture, name and version (content may differ)
    pub fn same_package(&self, other: &PackageRef) -> bool {
        self.architecture() == other.architecture()
            && self.name() == other.name()
            && self.version() == other.version()
    }

    /// Everything but the files hash; equal for refs of the same package
    pub fn package_key(&self) -> &str {
        match self.0.rfind(' ') {
            Some(position) => &self.0[..=position],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file belonging to a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    /// Base name, e.g. `hello_2.10-2_amd64.deb`
    pub filename: String,
    pub checksums: ChecksumInfo,
    /// Path relative to the pool root, empty until imported
    #[serde(default)]
    pub pool_path: String,
    /// Path relative to the mirror root for remote packages
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub download_path: String,
}

impl PackageFile {
    pub fn new(filename: impl Into<String>, checksums: ChecksumInfo) -> Self {
        Self {
            filename: filename.into(),
            checksums,
            pool_path: String::new(),
            download_path: String::new(),
        }
    }
}

/// A binary package: control stanza plus its files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub files: Vec<PackageFile>,
    /// Control fields, without the per-file fields
    pub stanza: Stanza,
}

fn required_field(stanza: &Stanza, field: &str) -> Result<String> {
    let value = stanza
        .get(field)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Validation(format!("missing required field {}", field)))?;
    if value.contains(char::is_whitespace) {
        return Err(Error::Validation(format!(
            "field {} contains whitespace: {}",
            field, value
        )));
    }
    Ok(value.to_string())
}

impl Package {
    /// Build a package from a `.deb` control stanza
    pub fn from_control(mut stanza: Stanza) -> Result<Self> {
        let name = required_field(&stanza, "Package")?;
        let version = required_field(&stanza, "Version")?;
        let architecture = required_field(&stanza, "Architecture")?;
        let source = stanza
            .get("Source")
            .and_then(|source| source.split_whitespace().next())
            .map(str::to_string);

        for field in FILE_FIELDS {
            stanza.remove(field);
        }

        Ok(Self {
            name,
            version,
            architecture,
            source,
            files: Vec::new(),
            stanza,
        })
    }

    /// Build a package from a remote `Packages` index entry
    pub fn from_index(stanza: Stanza) -> Result<Self> {
        let filename = required_field(&stanza, "Filename")?;
        let size = required_field(&stanza, "Size")?
            .parse::<u64>()
            .map_err(|e| Error::ParseError(format!("invalid Size for {}: {}", filename, e)))?;

        let field = |name: &str| stanza.get(name).unwrap_or("").trim().to_lowercase();
        let checksums = ChecksumInfo {
            size,
            md5: field("MD5sum"),
            sha1: field("SHA1"),
            sha256: field("SHA256"),
            sha512: field("SHA512"),
        };
        if checksums.sha256.is_empty() && checksums.md5.is_empty() {
            return Err(Error::Validation(format!("no checksums for {}", filename)));
        }

        let basename = filename.rsplit('/').next().unwrap_or(&filename).to_string();
        let mut file = PackageFile::new(basename, checksums);
        file.download_path = filename;

        let mut package = Self::from_control(stanza)?;
        package.files.push(file);
        Ok(package)
    }

    /// Short hash over the identity of every file
    pub fn files_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.filename.as_bytes());
            hasher.update([0]);
            hasher.update(file.checksums.size.to_string().as_bytes());
            hasher.update([0]);
            hasher.update(file.checksums.sha256.as_bytes());
            hasher.update(file.checksums.md5.as_bytes());
            hasher.update(b"\n");
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_string()
    }

    pub fn reference(&self) -> PackageRef {
        PackageRef::new(&self.architecture, &self.name, &self.version, &self.files_hash())
    }

    /// `name_version_arch`, for messages
    pub fn short_key(&self) -> String {
        format!("{}_{}_{}", self.name, self.version, self.architecture)
    }

    pub fn source_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    /// Directory under `pool/<component>/`: `h/hello`, `libx/libxml2`
    pub fn pool_directory(&self) -> Result<String> {
        let source = self.source_name();
        if source.is_empty() {
            return Err(Error::Validation(format!(
                "package {} has an empty source name",
                self.short_key()
            )));
        }
        let head: String = if source.starts_with("lib") && source.chars().count() > 3 {
            source.chars().take(4).collect()
        } else {
            source.chars().take(1).collect()
        };
        Ok(format!("{}/{}", head, source))
    }

    /// Packages with `Architecture: all` belong to every architecture
    pub fn matches_architecture(&self, architecture: &str) -> bool {
        self.architecture == architecture || self.architecture == "all"
    }

    /// Stanza for a `Packages` index in `component`
    pub fn index_stanza(&self, component: &str) -> Result<Stanza> {
        let file = self.files.first().ok_or_else(|| {
            Error::Internal(format!("package {} has no files", self.short_key()))
        })?;

        let mut stanza = self.stanza.clone();
        stanza.set(
            "Filename",
            format!(
                "pool/{}/{}/{}",
                component,
                self.pool_directory()?,
                file.filename
            ),
        );
        stanza.set("Size", file.checksums.size.to_string());
        let digests = [
            ("MD5sum", &file.checksums.md5),
            ("SHA1", &file.checksums.sha1),
            ("SHA256", &file.checksums.sha256),
            ("SHA512", &file.checksums.sha512),
        ];
        for (field, value) in digests {
            if !value.is_empty() {
                stanza.set(field, value.clone());
            }
        }
        Ok(stanza)
    }
}
