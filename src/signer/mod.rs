// src/signer/mod.rs

//! Signing and verification of repository metadata
//!
//! Two providers implement [`Signer`] and [`Verifier`]: [`gpg`] drives the
//! external `gpg`/`gpgv` tools and [`openpgp`] signs in-process with
//! sequoia. Publishing signs the top-level `Release` into `Release.gpg`
//! and `InRelease`; mirror updates verify what they download.

pub mod gpg;
pub mod openpgp;

pub use gpg::{GpgSigner, GpgVerifier};
pub use openpgp::{OpenPgpSigner, OpenPgpVerifier};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub trait Signer: Send + Sync {
    /// Write an armored detached signature of `source` to `destination`
    fn detached_sign(&self, source: &Path, destination: &Path) -> Result<()>;

    /// Write a clear-signed copy of `source` to `destination`
    fn clear_sign(&self, source: &Path, destination: &Path) -> Result<()>;
}

pub trait Verifier: Send + Sync {
    fn verify_detached_signature(&self, signature: &[u8], data: &[u8]) -> Result<()>;

    /// Check a clear-signed message and return the signed text
    fn verify_clearsigned(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Which implementation signs and verifies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Gpg,
    Internal,
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gpg" => Ok(Provider::Gpg),
            "internal" => Ok(Provider::Internal),
            other => Err(Error::Validation(format!("unknown gpg provider: {}", other))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::Gpg => "gpg",
            Provider::Internal => "internal",
        })
    }
}

/// Key selection for signing
#[derive(Debug, Clone, Default)]
pub struct SigningOptions {
    /// Key id, fingerprint or user id fragment
    pub key: Option<String>,
    pub keyring: Option<PathBuf>,
    pub secret_keyring: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub passphrase_file: Option<PathBuf>,
    /// Never prompt
    pub batch: bool,
}

impl SigningOptions {
    /// Passphrase given inline or read from the passphrase file
    pub fn resolve_passphrase(&self) -> Result<Option<String>> {
        if let Some(passphrase) = &self.passphrase {
            return Ok(Some(passphrase.clone()));
        }
        match &self.passphrase_file {
            Some(path) => Ok(Some(
                std::fs::read_to_string(path)?.trim_end_matches(['\r', '\n']).to_string(),
            )),
            None => Ok(None),
        }
    }
}

pub fn new_signer(provider: Provider, options: &SigningOptions) -> Result<Box<dyn Signer>> {
    match provider {
        Provider::Gpg => Ok(Box::new(GpgSigner::new(options.clone()))),
        Provider::Internal => Ok(Box::new(OpenPgpSigner::from_options(options)?)),
    }
}

pub fn new_verifier(provider: Provider, keyrings: &[PathBuf]) -> Result<Box<dyn Verifier>> {
    match provider {
        Provider::Gpg => Ok(Box::new(GpgVerifier::new(keyrings.to_vec()))),
        Provider::Internal => Ok(Box::new(OpenPgpVerifier::from_keyrings(keyrings)?)),
    }
}

const CLEARSIGN_BEGIN: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";

/// Text of a clear-signed message without checking the signature
///
/// Input that is not clear-signed is returned unchanged.
pub fn strip_clearsign(text: &str) -> Result<String> {
    let mut lines = text.lines();
    if lines.next().map(str::trim_end) != Some(CLEARSIGN_BEGIN) {
        return Ok(text.to_string());
    }

    // Armor headers ("Hash: SHA256") end at the first blank line
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
    }

    let mut body: Vec<&str> = Vec::new();
    for line in lines {
        if line.trim_end() == SIGNATURE_BEGIN {
            let mut result = body.join("\n");
            result.push('\n');
            return Ok(result);
        }
        body.push(line.strip_prefix("- ").unwrap_or(line));
    }
    Err(Error::ParseError(
        "clear-signed message has no signature block".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_clearsign() {
        let signed = "-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA256

Origin: Debian
- -dashed line
-----BEGIN PGP SIGNATURE-----

abc
-----END PGP SIGNATURE-----
";
        assert_eq!(strip_clearsign(signed).unwrap(), "Origin: Debian\n-dashed line\n");
        assert_eq!(strip_clearsign("Origin: x\n").unwrap(), "Origin: x\n");

        let truncated = "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\nOrigin: x\n";
        assert!(matches!(strip_clearsign(truncated), Err(Error::ParseError(_))));
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("gpg".parse::<Provider>().unwrap(), Provider::Gpg);
        assert_eq!("internal".parse::<Provider>().unwrap(), Provider::Internal);
        assert!(matches!("pgp".parse::<Provider>(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_passphrase_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, "secret\n").unwrap();

        let options = SigningOptions {
            passphrase_file: Some(path),
            ..Default::default()
        };
        assert_eq!(options.resolve_passphrase().unwrap().as_deref(), Some("secret"));
        assert_eq!(SigningOptions::default().resolve_passphrase().unwrap(), None);
    }
}
