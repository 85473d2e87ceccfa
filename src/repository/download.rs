// src/repository/download.rs

//! HTTP downloads for mirror updates
//!
//! Failures are returned as-is: there is no automatic retry, a failed mirror
//! update is resubmitted by the caller.

use crate::error::{Error, Result};
use crate::task::Cancellation;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const CHUNK_SIZE: usize = 64 * 1024;

/// Fetches remote files
pub trait Downloader: Send + Sync {
    /// Fetch a small file into memory; a missing file is `NotFound`
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>>;

    /// Stream a file to `destination`, checking `cancel` between chunks
    fn download(&self, url: &str, destination: &Path, cancel: &Cancellation) -> Result<()>;
}

/// reqwest-backed downloader
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("debpool/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::Download(format!("{}: {}", url, e)))?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("{} not found (HTTP 404)", url))),
            status => Err(Error::Download(format!("HTTP {} from {}", status, url))),
        }
    }
}

impl Downloader for HttpDownloader {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        debug!("Fetching {}", url);
        let bytes = self
            .get(url)?
            .bytes()
            .map_err(|e| Error::Download(format!("Failed to read {}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }

    fn download(&self, url: &str, destination: &Path, cancel: &Cancellation) -> Result<()> {
        info!("Downloading {} to {}", url, destination.display());
        cancel.check("download")?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut response = self.get(url)?;

        // Write to temporary file first
        let temp_path = destination.with_extension("part");
        let mut file = File::create(&temp_path)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            if let Err(e) = cancel.check("download") {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
            let read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(Error::Download(format!("{}: {}", url, e)));
                }
            };
            file.write_all(&buffer[..read])?;
        }
        file.sync_all()?;

        fs::rename(&temp_path, destination)?;
        debug!("Downloaded {}", destination.display());
        Ok(())
    }
}
