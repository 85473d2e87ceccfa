// src/signer/openpgp.rs

//! In-process OpenPGP provider built on sequoia

use crate::error::{Error, Result};
use crate::signer::{Signer, SigningOptions, Verifier};
use sequoia_openpgp as sq;
use sq::armor;
use sq::cert::{Cert, CertParser};
use sq::crypto::Password;
use sq::packet::Key;
use sq::packet::key::{SecretParts, UnspecifiedRole};
use sq::parse::Parse;
use sq::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper, VerifierBuilder,
};
use sq::policy::StandardPolicy;
use sq::serialize::stream::{Armorer, Message, Signer as StreamSigner};
use std::fmt::Display;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

fn signing_error(e: impl Display) -> Error {
    Error::Signing(e.to_string())
}

fn read_certs(path: &Path) -> Result<Vec<Cert>> {
    CertParser::from_file(path)
        .map_err(|e| Error::Signing(format!("unable to read keyring {}: {}", path.display(), e)))?
        .collect::<sq::Result<Vec<Cert>>>()
        .map_err(|e| Error::Signing(format!("invalid keyring {}: {}", path.display(), e)))
}

/// Whether `selector` names this certificate by id, fingerprint or user id
fn cert_matches(cert: &Cert, selector: &str) -> bool {
    let selector_hex = selector.trim_start_matches("0x").to_uppercase();
    if cert.fingerprint().to_hex().ends_with(&selector_hex) {
        return true;
    }
    if cert
        .keys()
        .any(|ka| ka.key().fingerprint().to_hex().ends_with(&selector_hex))
    {
        return true;
    }
    cert.userids()
        .any(|ua| String::from_utf8_lossy(ua.userid().value()).contains(selector))
}

pub struct OpenPgpSigner {
    key: Key<SecretParts, UnspecifiedRole>,
}

impl OpenPgpSigner {
    pub fn from_options(options: &SigningOptions) -> Result<Self> {
        let keyring = options
            .secret_keyring
            .as_ref()
            .or(options.keyring.as_ref())
            .ok_or_else(|| {
                Error::Validation("internal signer requires a secret keyring".to_string())
            })?;
        Self::from_keyring(
            keyring,
            options.key.as_deref(),
            options.resolve_passphrase()?.as_deref(),
        )
    }

    /// Load the first usable signing key, optionally selected by `key`
    pub fn from_keyring(path: &Path, key: Option<&str>, passphrase: Option<&str>) -> Result<Self> {
        let policy = StandardPolicy::new();

        for cert in read_certs(path)? {
            if key.is_some_and(|selector| !cert_matches(&cert, selector)) {
                continue;
            }
            let Some(amalgamation) = cert
                .keys()
                .with_policy(&policy, None)
                .supported()
                .alive()
                .revoked(false)
                .for_signing()
                .secret()
                .next()
            else {
                continue;
            };

            let mut secret = amalgamation.key().clone();
            if secret.secret().is_encrypted() {
                let passphrase = passphrase.ok_or_else(|| {
                    Error::Signing(format!(
                        "key {} is protected, passphrase required",
                        cert.fingerprint()
                    ))
                })?;
                secret = secret
                    .decrypt_secret(&Password::from(passphrase))
                    .map_err(|e| Error::Signing(format!("unable to unlock key: {}", e)))?;
            }
            debug!("Signing with key {}", secret.fingerprint());
            return Ok(Self { key: secret });
        }

        Err(Error::Signing(format!(
            "no usable signing key{} in {}",
            key.map(|k| format!(" matching {}", k)).unwrap_or_default(),
            path.display()
        )))
    }

    fn sign(&self, source: &Path, destination: &Path, cleartext: bool) -> Result<()> {
        let data = fs::read(source)?;
        let keypair = self.key.clone().into_keypair().map_err(signing_error)?;

        let mut sink = Vec::new();
        {
            let message = Message::new(&mut sink);
            let mut writer = if cleartext {
                StreamSigner::new(message, keypair)
                    .cleartext()
                    .build()
                    .map_err(signing_error)?
            } else {
                let armored = Armorer::new(message)
                    .kind(armor::Kind::Signature)
                    .build()
                    .map_err(signing_error)?;
                StreamSigner::new(armored, keypair)
                    .detached()
                    .build()
                    .map_err(signing_error)?
            };
            writer.write_all(&data)?;
            writer.finalize().map_err(signing_error)?;
        }

        fs::write(destination, sink)?;
        Ok(())
    }
}

impl Signer for OpenPgpSigner {
    fn detached_sign(&self, source: &Path, destination: &Path) -> Result<()> {
        self.sign(source, destination, false)
    }

    fn clear_sign(&self, source: &Path, destination: &Path) -> Result<()> {
        self.sign(source, destination, true)
    }
}

/// Checks signatures against the certificates of trusted keyrings
pub struct OpenPgpVerifier {
    certs: Vec<Cert>,
}

struct Helper<'a> {
    certs: &'a [Cert],
}

impl VerificationHelper for Helper<'_> {
    fn get_certs(&mut self, _ids: &[sq::KeyHandle]) -> sq::Result<Vec<Cert>> {
        Ok(self.certs.to_vec())
    }

    fn check(&mut self, structure: MessageStructure) -> sq::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.iter().any(|result| result.is_ok()) {
                    return Ok(());
                }
                return Err(anyhow::anyhow!("no valid signature from a trusted key"));
            }
        }
        Err(anyhow::anyhow!("message is not signed"))
    }
}

impl OpenPgpVerifier {
    pub fn from_keyrings(paths: &[PathBuf]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::Validation(
                "internal verifier requires at least one keyring".to_string(),
            ));
        }
        let mut certs = Vec::new();
        for path in paths {
            certs.extend(read_certs(path)?);
        }
        Ok(Self { certs })
    }
}

impl Verifier for OpenPgpVerifier {
    fn verify_detached_signature(&self, signature: &[u8], data: &[u8]) -> Result<()> {
        let policy = StandardPolicy::new();
        let helper = Helper { certs: &self.certs };
        let mut verifier = DetachedVerifierBuilder::from_bytes(signature)
            .map_err(signing_error)?
            .with_policy(&policy, None, helper)
            .map_err(signing_error)?;
        verifier.verify_bytes(data).map_err(signing_error)
    }

    fn verify_clearsigned(&self, data: &[u8]) -> Result<Vec<u8>> {
        let policy = StandardPolicy::new();
        let helper = Helper { certs: &self.certs };
        let mut verifier = VerifierBuilder::from_bytes(data)
            .map_err(signing_error)?
            .with_policy(&policy, None, helper)
            .map_err(signing_error)?;

        let mut content = Vec::new();
        verifier.read_to_end(&mut content).map_err(signing_error)?;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sq::cert::CertBuilder;
    use sq::serialize::Serialize;

    fn keyrings(dir: &Path) -> (PathBuf, PathBuf) {
        let (cert, _) = CertBuilder::general_purpose(None, Some("test@example.com"))
            .generate()
            .unwrap();

        let secret = dir.join("secret.key");
        let mut buf = Vec::new();
        cert.as_tsk().serialize(&mut buf).unwrap();
        fs::write(&secret, buf).unwrap();

        let public = dir.join("public.key");
        let mut buf = Vec::new();
        cert.serialize(&mut buf).unwrap();
        fs::write(&public, buf).unwrap();

        (secret, public)
    }

    #[test]
    fn test_sign_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, public) = keyrings(dir.path());
        let release = dir.path().join("Release");
        fs::write(&release, "Origin: debpool\nSuite: stable\n").unwrap();

        let signer = OpenPgpSigner::from_keyring(&secret, Some("test@example.com"), None).unwrap();
        signer.detached_sign(&release, &dir.path().join("Release.gpg")).unwrap();
        signer.clear_sign(&release, &dir.path().join("InRelease")).unwrap();

        let verifier = OpenPgpVerifier::from_keyrings(&[public]).unwrap();
        let data = fs::read(&release).unwrap();
        let signature = fs::read(dir.path().join("Release.gpg")).unwrap();
        assert!(String::from_utf8_lossy(&signature).starts_with("-----BEGIN PGP SIGNATURE-----"));
        verifier.verify_detached_signature(&signature, &data).unwrap();
        assert!(verifier.verify_detached_signature(&signature, b"tampered").is_err());

        let inrelease = fs::read(dir.path().join("InRelease")).unwrap();
        let content = verifier.verify_clearsigned(&inrelease).unwrap();
        assert!(String::from_utf8_lossy(&content).contains("Suite: stable"));
    }

    #[test]
    fn test_untrusted_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, _) = keyrings(dir.path());
        let other = tempfile::tempdir().unwrap();
        let (_, other_public) = keyrings(other.path());

        let release = dir.path().join("Release");
        fs::write(&release, "Origin: debpool\n").unwrap();
        let signer = OpenPgpSigner::from_keyring(&secret, None, None).unwrap();
        signer.detached_sign(&release, &dir.path().join("Release.gpg")).unwrap();

        let verifier = OpenPgpVerifier::from_keyrings(&[other_public]).unwrap();
        let signature = fs::read(dir.path().join("Release.gpg")).unwrap();
        assert!(matches!(
            verifier.verify_detached_signature(&signature, b"Origin: debpool\n"),
            Err(Error::Signing(_))
        ));
    }

    #[test]
    fn test_unknown_key_selector() {
        let dir = tempfile::tempdir().unwrap();
        let (secret, _) = keyrings(dir.path());
        assert!(OpenPgpSigner::from_keyring(&secret, Some("nobody@example.org"), None).is_err());
        assert!(OpenPgpVerifier::from_keyrings(&[]).is_err());
    }
}
