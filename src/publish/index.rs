// src/publish/index.rs

//! Generation of the `dists/<distribution>` tree
//!
//! Files are written into a staging directory that later replaces the
//! published one. Every generated file is recorded with its checksums so
//! the top-level `Release` can list them.

use crate::error::Result;
use crate::packages::{Package, Stanza, compare_versions};
use crate::pool::ChecksumInfo;
use crate::publish::published::PublishedRepo;
use crate::signer::Signer;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use xz2::write::XzEncoder;

/// Format of the `Date` field
pub const RELEASE_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S UTC";

const DESCRIPTION: &str = "Generated by debpool";

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn xz(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Writer of one distribution's index files
pub struct IndexFiles {
    root: PathBuf,
    generated: BTreeMap<String, ChecksumInfo>,
}

impl IndexFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            generated: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files written so far, relative to the root, with their checksums
    pub fn generated(&self) -> &BTreeMap<String, ChecksumInfo> {
        &self.generated
    }

    fn write(&mut self, relative: &str, data: &[u8]) -> Result<()> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        self.generated
            .insert(relative.to_string(), ChecksumInfo::compute_bytes(data));
        debug!("Generated {}", relative);
        Ok(())
    }

    /// `Packages`, `Packages.gz` and `Packages.xz` of one component/architecture
    pub fn write_packages_index(
        &mut self,
        component: &str,
        architecture: &str,
        packages: &[&Package],
    ) -> Result<()> {
        let mut sorted: Vec<&Package> = packages.to_vec();
        sorted.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| compare_versions(&a.version, &b.version))
                .then_with(|| a.architecture.cmp(&b.architecture))
        });

        let mut content = String::new();
        for (index, package) in sorted.iter().enumerate() {
            if index > 0 {
                content.push('\n');
            }
            content.push_str(&package.index_stanza(component)?.to_string());
        }

        let base = format!("{}/binary-{}/Packages", component, architecture);
        let data = content.into_bytes();
        self.write(&format!("{}.gz", base), &gzip(&data)?)?;
        self.write(&format!("{}.xz", base), &xz(&data)?)?;
        self.write(&base, &data)
    }

    /// Per-architecture `Release` of a component
    pub fn write_arch_release(
        &mut self,
        repo: &PublishedRepo,
        component: &str,
        architecture: &str,
    ) -> Result<()> {
        let mut stanza = Stanza::new();
        if !repo.origin.is_empty() {
            stanza.set("Origin", repo.origin.as_str());
        }
        if !repo.label.is_empty() {
            stanza.set("Label", repo.label.as_str());
        }
        stanza.set("Archive", repo.distribution.as_str());
        stanza.set("Architecture", architecture);
        stanza.set("Component", component);

        let path = format!("{}/binary-{}/Release", component, architecture);
        self.write(&path, stanza.to_string().as_bytes())
    }

    /// `Contents-<arch>.gz`: file path to comma-separated `section/package`
    pub fn write_contents(
        &mut self,
        component: &str,
        architecture: &str,
        contents: &BTreeMap<String, Vec<String>>,
    ) -> Result<()> {
        let mut text = String::new();
        for (path, owners) in contents {
            text.push_str(&format!("{} {}\n", path, owners.join(",")));
        }
        let path = format!("{}/Contents-{}.gz", component, architecture);
        self.write(&path, &gzip(text.as_bytes())?)
    }

    /// Top-level `Release` listing every generated file; returns its path
    pub fn write_release(
        &mut self,
        repo: &PublishedRepo,
        architectures: &[String],
        date: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let mut stanza = Stanza::new();
        if !repo.origin.is_empty() {
            stanza.set("Origin", repo.origin.as_str());
        }
        if !repo.label.is_empty() {
            stanza.set("Label", repo.label.as_str());
        }
        stanza.set("Suite", repo.distribution.as_str());
        stanza.set("Codename", repo.distribution.as_str());
        stanza.set("Date", date.format(RELEASE_DATE_FORMAT).to_string());
        stanza.set("Architectures", architectures.join(" "));
        stanza.set("Components", repo.components().collect::<Vec<_>>().join(" "));
        stanza.set("Description", DESCRIPTION);

        let digests: [(&str, fn(&ChecksumInfo) -> &str); 4] = [
            ("MD5Sum", |c| c.md5.as_str()),
            ("SHA1", |c| c.sha1.as_str()),
            ("SHA256", |c| c.sha256.as_str()),
            ("SHA512", |c| c.sha512.as_str()),
        ];
        for (field, digest) in digests {
            let mut value = String::new();
            for (path, checksums) in &self.generated {
                value.push_str(&format!(
                    "\n {} {:>8} {}",
                    digest(checksums),
                    checksums.size,
                    path
                ));
            }
            stanza.set(field, value);
        }

        let path = self.root.join("Release");
        fs::write(&path, stanza.to_string())?;
        Ok(path)
    }

    /// `Release.gpg` and `InRelease` next to the `Release` file
    pub fn sign(&self, signer: &dyn Signer) -> Result<()> {
        let release = self.root.join("Release");
        signer.detached_sign(&release, &self.root.join("Release.gpg"))?;
        signer.clear_sign(&release, &self.root.join("InRelease"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageFile;
    use crate::packages::stanza::parse_stanza;
    use crate::publish::published::SourceKind;
    use crate::repository::parsers::debian::{decompress_index, parse_packages, parse_release};
    use chrono::TimeZone;

    fn package(name: &str, version: &str, arch: &str) -> Package {
        let control = format!(
            "Package: {}\nVersion: {}\nArchitecture: {}\nDescription: test\n multi-line\n",
            name, version, arch
        );
        let mut package = Package::from_control(parse_stanza(&control).unwrap()).unwrap();
        package.files.push(PackageFile::new(
            format!("{}_{}_{}.deb", name, version, arch),
            ChecksumInfo::compute_bytes(format!("{}{}", name, version).as_bytes()),
        ));
        package
    }

    fn repo() -> PublishedRepo {
        let sources = [("main".to_string(), "uuid".to_string())].into();
        let mut repo =
            PublishedRepo::new("", ".", "stable", SourceKind::Local, sources, vec![]).unwrap();
        repo.origin = "Example".to_string();
        repo
    }

    #[test]
    fn test_packages_index_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = IndexFiles::new(dir.path());
        let newer = package("hello", "1.10", "amd64");
        let older = package("hello", "1.9", "amd64");
        let doc = package("aaa-doc", "1.0", "all");

        index
            .write_packages_index("main", "amd64", &[&newer, &older, &doc])
            .unwrap();

        let plain = fs::read_to_string(dir.path().join("main/binary-amd64/Packages")).unwrap();
        let parsed = parse_packages(&plain).unwrap();
        let order: Vec<(&str, &str)> = parsed
            .iter()
            .map(|p| (p.name.as_str(), p.version.as_str()))
            .collect();
        assert_eq!(order, vec![("aaa-doc", "1.0"), ("hello", "1.9"), ("hello", "1.10")]);
        assert_eq!(
            parsed[1].files[0].download_path,
            "pool/main/h/hello/hello_1.9_amd64.deb"
        );

        let gz = fs::read(dir.path().join("main/binary-amd64/Packages.gz")).unwrap();
        assert_eq!(decompress_index("Packages.gz", &gz).unwrap(), plain);
        let xz = fs::read(dir.path().join("main/binary-amd64/Packages.xz")).unwrap();
        assert_eq!(decompress_index("Packages.xz", &xz).unwrap(), plain);
        assert_eq!(index.generated().len(), 3);
    }

    #[test]
    fn test_release_lists_generated_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = IndexFiles::new(dir.path());
        let repo = repo();
        index
            .write_packages_index("main", "amd64", &[&package("hello", "1.0", "amd64")])
            .unwrap();
        index.write_arch_release(&repo, "main", "amd64").unwrap();

        let date = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let path = index
            .write_release(&repo, &["amd64".to_string()], date)
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("Date: Tue, 05 Mar 2024 07:08:09 UTC\n"));
        assert!(text.contains("Origin: Example\n"));

        let release = parse_release(&text).unwrap();
        assert_eq!(release.architectures, vec!["amd64"]);
        assert_eq!(release.components, vec!["main"]);
        assert_eq!(release.files.len(), 4);

        let arch_release = &index.generated()["main/binary-amd64/Release"];
        let listed = release.file("main/binary-amd64/Release").unwrap();
        assert_eq!(listed.sha256, arch_release.sha256);
        assert_eq!(listed.sha512, arch_release.sha512);
        assert_eq!(listed.size, arch_release.size);
        assert!(release.file("Release").is_none());
    }

    #[test]
    fn test_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = IndexFiles::new(dir.path());
        let mut contents = BTreeMap::new();
        contents.insert(
            "usr/bin/hello".to_string(),
            vec!["utils/hello".to_string(), "utils/hello-alt".to_string()],
        );
        index.write_contents("main", "amd64", &contents).unwrap();

        let data = fs::read(dir.path().join("main/Contents-amd64.gz")).unwrap();
        assert_eq!(
            decompress_index("Contents-amd64.gz", &data).unwrap(),
            "usr/bin/hello utils/hello,utils/hello-alt\n"
        );
    }
}
