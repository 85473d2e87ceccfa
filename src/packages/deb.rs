// src/packages/deb.rs

//! Debian binary package reader
//!
//! A .deb is an AR archive holding `debian-binary`, a `control.tar.*` and a
//! `data.tar.*` member. Only the control stanza and the file list are needed
//! here: the stanza becomes the package metadata, the file list feeds the
//! `Contents-<arch>` indexes.

use crate::error::{Error, Result};
use crate::packages::stanza::{Stanza, parse_stanza};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

const COMPRESSIONS: &[&str] = &[".gz", ".xz", ".zst", ""];

/// Extract a member from the AR archive by name prefix
fn extract_ar_member(path: &Path, prefix: &str) -> Result<Option<(String, Vec<u8>)>> {
    let file = File::open(path)?;
    let mut archive = ar::Archive::new(file);

    while let Some(entry) = archive.next_entry() {
        let mut entry = entry.map_err(|e| {
            Error::ParseError(format!("{}: failed to read AR entry: {}", path.display(), e))
        })?;

        let entry_name = String::from_utf8_lossy(entry.header().identifier())
            .trim_end_matches('/')
            .to_string();

        if entry_name.starts_with(prefix) {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(Some((entry_name, content)));
        }
    }

    Ok(None)
}

/// Open a `*.tar[.gz|.xz|.zst]` member as a tar stream
fn tar_member(path: &Path, member: &str) -> Result<Archive<Box<dyn Read>>> {
    let (name, data) = extract_ar_member(path, member)?.ok_or_else(|| {
        Error::ParseError(format!("{}: no {} member in DEB archive", path.display(), member))
    })?;

    let compression = COMPRESSIONS
        .iter()
        .find(|ext| name == format!("{}{}", member, ext))
        .ok_or_else(|| {
            Error::ParseError(format!("{}: unsupported member {}", path.display(), name))
        })?;

    let data = std::io::Cursor::new(data);
    let reader: Box<dyn Read> = match *compression {
        ".gz" => Box::new(GzDecoder::new(data)),
        ".xz" => Box::new(XzDecoder::new(data)),
        ".zst" => Box::new(zstd::Decoder::new(data)?),
        _ => Box::new(data),
    };
    Ok(Archive::new(reader))
}

/// Read the control stanza of a .deb
pub fn read_control(path: &Path) -> Result<Stanza> {
    debug!("Reading control file of {}", path.display());
    let mut archive = tar_member(path, "control.tar")?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_string_lossy().to_string();

        if entry_path == "./control" || entry_path == "control" {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            return parse_stanza(&content);
        }
    }

    Err(Error::ParseError(format!(
        "{}: control file not found in control.tar",
        path.display()
    )))
}

/// List the regular files shipped by a .deb, without leading `./` or `/`
pub fn read_contents(path: &Path) -> Result<Vec<String>> {
    let mut archive = tar_member(path, "data.tar")?;
    let mut files = Vec::new();

    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let entry_path = entry.path()?.to_string_lossy().to_string();
        files.push(
            entry_path
                .trim_start_matches("./")
                .trim_start_matches('/')
                .to_string(),
        );
    }

    debug!("{} lists {} files", path.display(), files.len());
    Ok(files)
}


#[cfg(test)]
mod tests {
    use super::testing::build_deb;
    use super::*;

    #[test]
    fn test_read_control() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_deb(dir.path(), "hello", "2.10-2", "amd64", b"hi");

        let stanza = read_control(&path).unwrap();
        assert_eq!(stanza.get("Package"), Some("hello"));
        assert_eq!(stanza.get("Version"), Some("2.10-2"));
        assert_eq!(stanza.get("Architecture"), Some("amd64"));
    }

    #[test]
    fn test_read_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = build_deb(dir.path(), "hello", "1.0", "all", b"hi");

        assert_eq!(read_contents(&path).unwrap(), vec!["usr/share/hello/data"]);
    }

    #[test]
    fn test_not_a_deb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.deb");
        std::fs::write(&path, b"not an archive").unwrap();

        assert!(read_control(&path).is_err());
    }
}
