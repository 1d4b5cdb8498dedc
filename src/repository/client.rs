// src/repository/client.rs

//! Retrieval of repository descriptors and package archives
//!
//! Sources are either `http(s)://` URLs, downloaded with retries, or local
//! directories (optionally spelled `file://...`), copied directly.

use super::{CatalogEntry, DESCRIPTOR_FILE};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Retrieves catalog data for the planner and executor
pub trait Fetcher {
    /// Store the descriptor published at `source` under `dest`
    fn fetch_descriptor(&self, source: &str, dest: &Path) -> Result<()>;

    /// Retrieve the archive of `entry` into `dest_dir`, returning its path
    fn fetch_archive(&self, entry: &CatalogEntry, dest_dir: &Path) -> Result<PathBuf>;
}

/// HTTP client wrapper with retry support and local-path fallback
pub struct RepositoryClient {
    client: Client,
    max_retries: u32,
}

impl RepositoryClient {
    /// Create a new repository client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// Retrieve `location` to `dest_path`, over HTTP or from the local filesystem
    pub fn retrieve(&self, location: &str, dest_path: &Path) -> Result<()> {
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }

        if is_remote(location) {
            self.download_file(location, dest_path)
        } else {
            let source = local_path(location);
            debug!("Copying {} to {}", source.display(), dest_path.display());
            fs::copy(&source, dest_path).map_err(|e| {
                Error::DownloadError(format!("Failed to copy {}: {}", source.display(), e))
            })?;
            Ok(())
        }
    }

    /// Stream `url` into `dest_path`, retrying transport failures
    ///
    /// The body is written to a sibling temporary file and persisted once
    /// complete.
    fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        info!("Downloading {}", url);

        let mut attempt = 0;
        let mut response = loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) => break response,
                Err(e) if attempt < self.max_retries => {
                    warn!("Download attempt {} of {} failed: {}", attempt, url, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
                Err(e) => {
                    return Err(Error::DownloadError(format!(
                        "{} unreachable after {} attempts: {}",
                        url, attempt, e
                    )));
                }
            }
        };

        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let dir = dest_path.parent().unwrap_or_else(|| Path::new("."));
        let mut partial = NamedTempFile::new_in(dir)?;
        io::copy(&mut response, &mut partial)
            .map_err(|e| Error::DownloadError(format!("Transfer of {} failed: {}", url, e)))?;
        partial.persist(dest_path).map_err(|e| {
            Error::IoError(format!("Failed to store {}: {}", dest_path.display(), e))
        })?;

        debug!("Stored {}", dest_path.display());
        Ok(())
    }
}

impl Fetcher for RepositoryClient {
    fn fetch_descriptor(&self, source: &str, dest: &Path) -> Result<()> {
        let location = format!("{}/{}", source.trim_end_matches('/'), DESCRIPTOR_FILE);
        info!("Fetching repository descriptor from {}", location);
        self.retrieve(&location, dest)
    }

    fn fetch_archive(&self, entry: &CatalogEntry, dest_dir: &Path) -> Result<PathBuf> {
        let dest_path = dest_dir.join(entry.file_name());
        self.retrieve(&entry.download_location(), &dest_path)?;

        if let Some(expected) = &entry.sha256 {
            verify_checksum(&dest_path, expected)?;
        }

        Ok(dest_path)
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn local_path(location: &str) -> PathBuf {
    PathBuf::from(location.strip_prefix("file://").unwrap_or(location))
}

/// Check the SHA-256 digest of `path` against a hex string
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let mut hasher = Sha256::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    let actual = format!("{:x}", hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    debug!("{} matches {}", path.display(), expected);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::PackageInfo;
    use tempfile::TempDir;

    fn entry(source: &str, sha256: Option<String>) -> CatalogEntry {
        CatalogEntry {
            info: PackageInfo::parse(
                "name: hello\ndescription: d\nversion: \"1.0\"\nrevision: 1\narch: any\ntype: binary\n",
            )
            .unwrap(),
            repository: "local".to_string(),
            source: source.to_string(),
            download: "pkgs/hello-1.0-1-any.bpm".to_string(),
            download_size: 5,
            installed_size: 5,
            sha256,
        }
    }

    #[test]
    fn test_location_kinds() {
        assert!(is_remote("https://example.com/repo"));
        assert!(!is_remote("/srv/repo"));
        assert_eq!(local_path("file:///srv/repo"), PathBuf::from("/srv/repo"));
    }

    #[test]
    fn test_fetch_archive_from_local_source() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("pkgs")).unwrap();
        fs::write(source.path().join("pkgs/hello-1.0-1-any.bpm"), b"hello").unwrap();

        let dest = TempDir::new().unwrap();
        let client = RepositoryClient::new().unwrap();
        let path = client
            .fetch_archive(&entry(source.path().to_str().unwrap(), None), dest.path())
            .unwrap();

        assert_eq!(path, dest.path().join("hello-1.0-1-any.bpm"));
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_checksum_mismatch() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("pkgs")).unwrap();
        fs::write(source.path().join("pkgs/hello-1.0-1-any.bpm"), b"hello").unwrap();

        let dest = TempDir::new().unwrap();
        let client = RepositoryClient::new().unwrap();
        let result = client.fetch_archive(
            &entry(source.path().to_str().unwrap(), Some("00".repeat(32))),
            dest.path(),
        );
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_checksum_match() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"hello").unwrap();
        verify_checksum(
            &path,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        )
        .unwrap();
    }

    #[test]
    fn test_fetch_descriptor_from_local_source() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join(DESCRIPTOR_FILE), "version: \"1\"\n").unwrap();

        let root = TempDir::new().unwrap();
        let dest = root.path().join("var/lib/bpm/databases/main.bpmdb");
        let client = RepositoryClient::new().unwrap();
        client
            .fetch_descriptor(&format!("file://{}", source.path().display()), &dest)
            .unwrap();
        assert!(dest.exists());
    }
}
