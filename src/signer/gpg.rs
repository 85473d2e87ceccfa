// src/signer/gpg.rs

//! External `gpg`/`gpgv` provider

use crate::error::{Error, Result};
use crate::signer::{Signer, SigningOptions, Verifier};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

fn run(program: &str, args: &[OsString]) -> Result<Output> {
    debug!("Running {} {:?}", program, args);
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Signing(format!("unable to execute {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Signing(format!(
            "{} failed ({}): {}",
            program,
            output.status,
            stderr.trim()
        )));
    }
    Ok(output)
}

pub struct GpgSigner {
    program: String,
    options: SigningOptions,
}

impl GpgSigner {
    pub fn new(options: SigningOptions) -> Self {
        Self {
            program: "gpg".to_string(),
            options,
        }
    }

    fn base_args(&self) -> Result<Vec<OsString>> {
        let mut args: Vec<OsString> = vec!["--no-auto-check-trustdb".into()];
        if self.options.batch {
            args.push("--batch".into());
        }
        if let Some(keyring) = &self.options.keyring {
            args.push("--no-default-keyring".into());
            args.push("--keyring".into());
            args.push(keyring.into());
        }
        if let Some(secret) = &self.options.secret_keyring {
            args.push("--secret-keyring".into());
            args.push(secret.into());
        }
        if let Some(key) = &self.options.key {
            args.push("-u".into());
            args.push(key.into());
        }
        if let Some(passphrase) = &self.options.passphrase {
            args.extend(["--pinentry-mode".into(), "loopback".into()]);
            args.push("--passphrase".into());
            args.push(passphrase.into());
        } else if let Some(file) = &self.options.passphrase_file {
            args.extend(["--pinentry-mode".into(), "loopback".into()]);
            args.push("--passphrase-file".into());
            args.push(file.into());
        }
        Ok(args)
    }
}

impl Signer for GpgSigner {
    fn detached_sign(&self, source: &Path, destination: &Path) -> Result<()> {
        let mut args = self.base_args()?;
        args.extend([
            "-o".into(),
            destination.into(),
            "--armor".into(),
            "--yes".into(),
            "--detach-sign".into(),
            source.into(),
        ]);
        run(&self.program, &args)?;
        Ok(())
    }

    fn clear_sign(&self, source: &Path, destination: &Path) -> Result<()> {
        let mut args = self.base_args()?;
        args.extend([
            "-o".into(),
            destination.into(),
            "--digest-algo".into(),
            "SHA256".into(),
            "--yes".into(),
            "--clearsign".into(),
            source.into(),
        ]);
        run(&self.program, &args)?;
        Ok(())
    }
}

/// Verification with `gpgv` against trusted keyrings
pub struct GpgVerifier {
    program: String,
    keyrings: Vec<PathBuf>,
}

impl GpgVerifier {
    /// With no keyrings, gpgv falls back to `~/.gnupg/trustedkeys.gpg`
    pub fn new(keyrings: Vec<PathBuf>) -> Self {
        Self {
            program: "gpgv".to_string(),
            keyrings,
        }
    }

    fn keyring_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        for keyring in &self.keyrings {
            args.push("--keyring".into());
            args.push(keyring.into());
        }
        args
    }
}

fn temp_file_with(data: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}

impl Verifier for GpgVerifier {
    fn verify_detached_signature(&self, signature: &[u8], data: &[u8]) -> Result<()> {
        let signature_file = temp_file_with(signature)?;
        let data_file = temp_file_with(data)?;

        let mut args = self.keyring_args();
        args.push(signature_file.path().into());
        args.push(data_file.path().into());
        run(&self.program, &args)?;
        Ok(())
    }

    fn verify_clearsigned(&self, data: &[u8]) -> Result<Vec<u8>> {
        let message = temp_file_with(data)?;

        let mut args = self.keyring_args();
        args.extend(["--output".into(), "-".into()]);
        args.push(message.path().into());
        Ok(run(&self.program, &args)?.stdout)
    }
}
