// src/repository/parsers/debian.rs

//! Debian archive metadata: `Release` and `Packages` files
//!
//! Both use the RFC 822-like stanza format. A `Release` file lists every
//! index of the distribution with its size and digests; `Packages` files
//! hold one stanza per binary package.

use crate::error::{Error, Result};
use crate::packages::Package;
use crate::packages::stanza::{Stanza, parse_stanza, parse_stanzas};
use crate::pool::ChecksumInfo;
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::io::Read;
use tracing::debug;
use xz2::read::XzDecoder;

/// Parsed top-level `Release` file
#[derive(Debug, Clone)]
pub struct ReleaseFile {
    pub stanza: Stanza,
    pub architectures: Vec<String>,
    pub components: Vec<String>,
    /// Index path (relative to `dists/<dist>/`) to its checksums
    pub files: BTreeMap<String, ChecksumInfo>,
}

impl ReleaseFile {
    /// Checksums of `path`, if the release lists it
    pub fn file(&self, path: &str) -> Option<&ChecksumInfo> {
        self.files.get(path)
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Parse a `Release` (or the cleartext of an `InRelease`)
pub fn parse_release(content: &str) -> Result<ReleaseFile> {
    let stanza = parse_stanza(content)?;
    let mut files: BTreeMap<String, ChecksumInfo> = BTreeMap::new();

    for field in ["MD5Sum", "SHA1", "SHA256", "SHA512"] {
        let Some(value) = stanza.get(field) else {
            continue;
        };
        for line in value.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let [digest, size, path] = parts[..] else {
                return Err(Error::ParseError(format!(
                    "malformed {} entry in Release: {}",
                    field, line
                )));
            };
            let size = size.parse::<u64>().map_err(|e| {
                Error::ParseError(format!("invalid size in Release entry {}: {}", line, e))
            })?;

            let entry = files.entry(path.to_string()).or_default();
            entry.size = size;
            let digest = digest.to_lowercase();
            match field {
                "MD5Sum" => entry.md5 = digest,
                "SHA1" => entry.sha1 = digest,
                "SHA256" => entry.sha256 = digest,
                _ => entry.sha512 = digest,
            }
        }
    }

    // Components may be given as "updates/main"; keep the last segment
    let components = split_list(stanza.get("Components"))
        .into_iter()
        .map(|c| c.rsplit('/').next().unwrap_or(&c).to_string())
        .collect();

    debug!("Release lists {} files", files.len());
    Ok(ReleaseFile {
        architectures: split_list(stanza.get("Architectures")),
        components,
        files,
        stanza,
    })
}

/// Parse a `Packages` index into packages with download paths
pub fn parse_packages(content: &str) -> Result<Vec<Package>> {
    let packages = parse_stanzas(content)?
        .into_iter()
        .map(Package::from_index)
        .collect::<Result<Vec<_>>>()?;
    debug!("Parsed {} package entries", packages.len());
    Ok(packages)
}

/// Decompress an index according to its file name
pub fn decompress_index(name: &str, data: &[u8]) -> Result<String> {
    let mut content = String::new();
    let result = if name.ends_with(".gz") {
        GzDecoder::new(data).read_to_string(&mut content)
    } else if name.ends_with(".xz") {
        XzDecoder::new(data).read_to_string(&mut content)
    } else {
        return String::from_utf8(data.to_vec())
            .map_err(|e| Error::ParseError(format!("{} is not UTF-8: {}", name, e)));
    };
    result.map_err(|e| Error::ParseError(format!("Failed to decompress {}: {}", name, e)))?;
    Ok(content)
}

/// Candidate `Packages` indexes of a component/architecture, best first
pub fn packages_index_candidates(component: &str, architecture: &str) -> [String; 3] {
    let base = format!("{}/binary-{}/Packages", component, architecture);
    [format!("{}.xz", base), format!("{}.gz", base), base]
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const RELEASE: &str = "Origin: Debian
Label: Debian
Suite: stable
Codename: bookworm
Architectures: amd64 arm64
Components: main updates/contrib
MD5Sum:
 d41d8cd98f00b204e9800998ecf8427e 0 main/binary-amd64/Packages
 0123456789abcdef0123456789abcdef 120 main/binary-amd64/Packages.gz
SHA256:
 E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855 0 main/binary-amd64/Packages
";

    #[test]
    fn test_parse_release() {
        let release = parse_release(RELEASE).unwrap();
        assert_eq!(release.architectures, vec!["amd64", "arm64"]);
        assert_eq!(release.components, vec!["main", "contrib"]);
        assert_eq!(release.stanza.get("Codename"), Some("bookworm"));

        let packages = release.file("main/binary-amd64/Packages").unwrap();
        assert_eq!(packages.size, 0);
        assert_eq!(packages.md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            packages.sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(release.file("main/binary-amd64/Packages.gz").unwrap().size, 120);
        assert!(release.file("main/binary-arm64/Packages").is_none());
    }

    #[test]
    fn test_malformed_release_entry() {
        let content = "Suite: stable\nMD5Sum:\n abc main/Packages\n";
        assert!(matches!(parse_release(content), Err(Error::ParseError(_))));
    }

    #[test]
    fn test_parse_packages() {
        let content = "Package: hello
Version: 2.10-2
Architecture: amd64
Filename: pool/main/h/hello/hello_2.10-2_amd64.deb
Size: 56132
SHA256: 35b1508eeee9c1dfba798c4c04304ef0f266990f936a51f165571edf53325cbc
Description: example package

Package: hello-doc
Version: 2.10-2
Architecture: all
Source: hello
Filename: pool/main/h/hello/hello-doc_2.10-2_all.deb
Size: 100
MD5sum: 0123456789abcdef0123456789abcdef
";
        let packages = parse_packages(content).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "hello");
        assert_eq!(packages[0].files[0].checksums.size, 56132);
        assert_eq!(packages[1].pool_directory().unwrap(), "h/hello");
        assert_eq!(
            packages[1].files[0].download_path,
            "pool/main/h/hello/hello-doc_2.10-2_all.deb"
        );
    }

    #[test]
    fn test_decompress_index() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"Package: x\n").unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress_index("Packages.gz", &compressed).unwrap(), "Package: x\n");
        assert_eq!(decompress_index("Packages", b"Package: y\n").unwrap(), "Package: y\n");
        assert!(decompress_index("Packages.gz", b"not gzip").is_err());
    }

    #[test]
    fn test_index_candidates() {
        assert_eq!(
            packages_index_candidates("main", "amd64"),
            [
                "main/binary-amd64/Packages.xz",
                "main/binary-amd64/Packages.gz",
                "main/binary-amd64/Packages"
            ]
        );
    }
}
