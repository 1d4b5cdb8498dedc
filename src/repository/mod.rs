// src/repository/mod.rs

//! Catalog lookup over repository descriptors
//!
//! This module provides:
//! - Loading repository descriptors (`<name>.bpmdb`) into `Repository` values
//! - Expanding split packages into synthetic entries
//! - Resolving names exactly, through virtual packages, and through `replaces`
//! - The `Catalog` value the resolver and planner are handed explicitly

mod client;

pub use client::{Fetcher, RepositoryClient};

use crate::config::RepositoryConfig;
use crate::db::DATABASES_DIR;
use crate::error::{Error, Result};
use crate::packages::info::normalize_name;
use crate::packages::{BpmPackage, PackageInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of a descriptor, both remotely and once synced
pub const DESCRIPTOR_FILE: &str = "database.bpmdb";

/// Repository descriptor document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub entries: BTreeMap<String, DescriptorEntry>,
}

/// One package as advertised by a descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorEntry {
    pub info: serde_yaml::Value,
    pub download: String,
    #[serde(default)]
    pub download_size: u64,
    #[serde(default)]
    pub installed_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl RepositoryDescriptor {
    /// Parse a descriptor from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::FormatError(format!("Invalid repository descriptor: {}", e)))
    }
}

/// A package candidate from a repository, not yet fetched or installed
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub info: PackageInfo,
    /// Name of the repository advertising this entry
    pub repository: String,
    /// Base location of that repository
    pub source: String,
    /// Archive path relative to `source`
    pub download: String,
    pub download_size: u64,
    pub installed_size: u64,
    pub sha256: Option<String>,
}

impl CatalogEntry {
    /// Full location of the archive
    pub fn download_location(&self) -> String {
        format!(
            "{}/{}",
            self.source.trim_end_matches('/'),
            self.download.trim_start_matches('/')
        )
    }

    /// File name the archive is stored under once fetched
    pub fn file_name(&self) -> String {
        self.download
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .unwrap_or_else(|| {
                format!(
                    "{}-{}-{}.bpm",
                    self.info.name,
                    self.info.full_version(),
                    self.info.arch
                )
            })
    }
}

/// Where a requested package comes from
#[derive(Debug, Clone)]
pub enum PackageCandidate {
    /// An archive already on the local filesystem
    Local { path: PathBuf, package: BpmPackage },
    /// An entry that has to be fetched from its repository first
    Remote(CatalogEntry),
}

impl PackageCandidate {
    pub fn info(&self) -> &PackageInfo {
        match self {
            PackageCandidate::Local { package, .. } => &package.info,
            PackageCandidate::Remote(entry) => &entry.info,
        }
    }
}

/// One loaded repository
#[derive(Debug, Clone, Default)]
pub struct Repository {
    pub name: String,
    pub source: String,
    pub entries: HashMap<String, CatalogEntry>,
    /// Virtual package name -> providing entries, in descriptor order
    pub virtual_packages: HashMap<String, Vec<String>>,
}

impl Repository {
    /// Build a repository from a parsed descriptor
    pub fn from_descriptor(
        name: &str,
        source: &str,
        descriptor: RepositoryDescriptor,
    ) -> Result<Self> {
        let mut repo = Repository {
            name: name.to_string(),
            source: source.to_string(),
            ..Default::default()
        };

        for (key, entry) in descriptor.entries {
            let info = PackageInfo::from_value(entry.info).map_err(|e| {
                Error::FormatError(format!("Entry {} in repository {}: {}", key, name, e))
            })?;

            for split in info.split_package_infos()? {
                let split_entry = CatalogEntry {
                    download: split_download(&entry.download, &split),
                    info: split,
                    repository: repo.name.clone(),
                    source: repo.source.clone(),
                    download_size: 0,
                    installed_size: 0,
                    sha256: None,
                };
                repo.add_entry(split_entry);
            }

            repo.add_entry(CatalogEntry {
                info,
                repository: repo.name.clone(),
                source: repo.source.clone(),
                download: entry.download,
                download_size: entry.download_size,
                installed_size: entry.installed_size,
                sha256: entry.sha256,
            });
        }

        debug!(
            "Loaded repository {} with {} entries",
            repo.name,
            repo.entries.len()
        );
        Ok(repo)
    }

    fn add_entry(&mut self, entry: CatalogEntry) {
        let name = normalize_name(&entry.info.name);
        for provided in &entry.info.provides {
            let providers = self
                .virtual_packages
                .entry(normalize_name(provided))
                .or_default();
            if !providers.contains(&name) {
                providers.push(name.clone());
            }
        }
        self.entries.insert(name, entry);
    }

    /// Location of the synced descriptor under `root`
    pub fn descriptor_path(root: &Path, name: &str) -> PathBuf {
        root.join(DATABASES_DIR).join(format!("{}.bpmdb", name))
    }

    /// Load a repository from its synced descriptor
    ///
    /// A repository that was never synced loads empty with a warning.
    pub fn load(root: &Path, config: &RepositoryConfig) -> Result<Self> {
        let path = Self::descriptor_path(root, &config.name);
        if !path.exists() {
            warn!(
                "Repository {} has not been synced yet ({} missing)",
                config.name,
                path.display()
            );
            return Ok(Repository {
                name: config.name.clone(),
                source: config.source.clone(),
                ..Default::default()
            });
        }

        let content = fs::read_to_string(&path)?;
        let descriptor = RepositoryDescriptor::parse(&content)?;
        Self::from_descriptor(&config.name, &config.source, descriptor)
    }

    pub fn entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(&normalize_name(name))
    }

    pub fn provider(&self, name: &str) -> Option<&CatalogEntry> {
        self.virtual_packages
            .get(&normalize_name(name))
            .and_then(|providers| providers.first())
            .and_then(|provider| self.entries.get(provider))
    }
}

/// Archive of a split package, published next to its parent's archive
fn split_download(parent_download: &str, split: &PackageInfo) -> String {
    let file = format!("{}-{}-{}.bpm", split.name, split.full_version(), split.arch);
    match parent_download.rsplit_once('/') {
        Some((dir, _)) => format!("{}/{}", dir, file),
        None => file,
    }
}

/// Every repository available to one operation, in priority order
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub repositories: Vec<Repository>,
}

impl Catalog {
    pub fn new(repositories: Vec<Repository>) -> Self {
        Self { repositories }
    }

    /// Load every enabled repository from its synced descriptor
    pub fn load(root: &Path, repositories: &[RepositoryConfig]) -> Result<Self> {
        let mut loaded = Vec::new();
        for config in repositories.iter().filter(|r| !r.disabled) {
            loaded.push(Repository::load(root, config)?);
        }
        Ok(Self::new(loaded))
    }

    /// Refresh every repository's descriptor through `fetcher`
    pub fn sync(&mut self, fetcher: &dyn Fetcher, root: &Path) -> Result<usize> {
        let mut total = 0;
        for repo in &mut self.repositories {
            info!("Synchronizing repository: {}", repo.name);

            let dest = Repository::descriptor_path(root, &repo.name);
            fetcher.fetch_descriptor(&repo.source, &dest)?;

            let content = fs::read_to_string(&dest)?;
            let descriptor = RepositoryDescriptor::parse(&content)?;
            *repo = Repository::from_descriptor(&repo.name, &repo.source, descriptor)?;

            info!(
                "Synchronized {} packages from repository {}",
                repo.entries.len(),
                repo.name
            );
            total += repo.entries.len();
        }
        Ok(total)
    }

    /// Entry with exactly this name
    pub fn find_entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.repositories.iter().find_map(|repo| repo.entry(name))
    }

    /// Entry providing this virtual package name
    pub fn find_provider(&self, name: &str) -> Option<&CatalogEntry> {
        self.repositories.iter().find_map(|repo| repo.provider(name))
    }

    /// Exact entry, falling back to a virtual package provider
    pub fn resolve(&self, name: &str) -> Option<&CatalogEntry> {
        self.find_entry(name).or_else(|| self.find_provider(name))
    }

    /// Entry declaring that it replaces `name`
    pub fn find_replacement(&self, name: &str) -> Option<&CatalogEntry> {
        let name = normalize_name(name);
        self.repositories.iter().find_map(|repo| {
            let mut candidates: Vec<&CatalogEntry> = repo
                .entries
                .values()
                .filter(|entry| {
                    normalize_name(&entry.info.name) != name
                        && entry.info.replaces.iter().any(|r| normalize_name(r) == name)
                })
                .collect();
            // HashMap order is arbitrary; keep the choice stable
            candidates.sort_by(|a, b| a.info.name.cmp(&b.info.name));
            candidates.into_iter().next()
        })
    }

    /// Look up a user request: an archive path or a package name
    pub fn lookup(&self, request: &str) -> Result<Option<PackageCandidate>> {
        let path = Path::new(request);
        if path.is_file() {
            let package = BpmPackage::read_archive(path)?;
            return Ok(Some(PackageCandidate::Local {
                path: path.to_path_buf(),
                package,
            }));
        }

        Ok(self.resolve(request).cloned().map(PackageCandidate::Remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"
version: "1"
entries:
  openssl:
    info:
      name: openssl
      description: TLS toolkit
      version: "3.0"
      revision: 2
      arch: x86_64
      type: binary
      provides: [libssl]
    download: openssl-3.0-2-x86_64.bpm
    download_size: 1000
    installed_size: 4000
  libressl:
    info:
      name: libressl
      description: TLS fork
      version: "3.8"
      revision: 1
      arch: x86_64
      type: binary
      replaces: [oldssl]
    download: libressl-3.8-1-x86_64.bpm
    download_size: 900
    installed_size: 3500
  toolkit:
    info:
      name: toolkit
      description: Toolkit sources
      version: "2.1"
      revision: 1
      arch: x86_64
      type: source
      split_packages:
        - name: toolkit-libs
          description: Libraries
          provides: [libtoolkit]
    download: toolkit-2.1-1-src.bpm
    download_size: 50
    installed_size: 0
"#;

    fn catalog() -> Catalog {
        let descriptor = RepositoryDescriptor::parse(DESCRIPTOR).unwrap();
        let repo = Repository::from_descriptor("main", "https://example.com/repo/", descriptor)
            .unwrap();
        Catalog::new(vec![repo])
    }

    #[test]
    fn test_find_entry() {
        let catalog = catalog();
        let entry = catalog.find_entry("OpenSSL").unwrap();
        assert_eq!(entry.info.full_version(), "3.0-2");
        assert_eq!(entry.repository, "main");
        assert_eq!(
            entry.download_location(),
            "https://example.com/repo/openssl-3.0-2-x86_64.bpm"
        );
        assert!(catalog.find_entry("missing").is_none());
    }

    #[test]
    fn test_virtual_package_resolution() {
        let catalog = catalog();
        assert!(catalog.find_entry("libssl").is_none());
        assert_eq!(catalog.resolve("libssl").unwrap().info.name, "openssl");
    }

    #[test]
    fn test_split_packages_expanded() {
        let catalog = catalog();
        let split = catalog.find_entry("toolkit-libs").unwrap();
        assert_eq!(split.info.full_version(), "2.1-1");
        assert_eq!(split.download, "toolkit-libs-2.1-1-x86_64.bpm");
        assert_eq!(split.installed_size, 0);
        assert!(split.sha256.is_none());
        assert_eq!(catalog.resolve("libtoolkit").unwrap().info.name, "toolkit-libs");
    }

    #[test]
    fn test_find_replacement() {
        let catalog = catalog();
        assert_eq!(catalog.find_replacement("oldssl").unwrap().info.name, "libressl");
        assert!(catalog.find_replacement("libressl").is_none());
    }

    #[test]
    fn test_first_repository_wins() {
        let descriptor = RepositoryDescriptor::parse(DESCRIPTOR).unwrap();
        let first = Repository::from_descriptor("first", "/srv/first", descriptor.clone()).unwrap();
        let second = Repository::from_descriptor("second", "/srv/second", descriptor).unwrap();
        let catalog = Catalog::new(vec![first, second]);
        assert_eq!(catalog.find_entry("openssl").unwrap().repository, "first");
    }

    #[test]
    fn test_invalid_entry_rejected() {
        let content = "version: \"1\"\nentries:\n  bad:\n    info:\n      name: bad\n    download: bad.bpm\n";
        let descriptor = RepositoryDescriptor::parse(content).unwrap();
        let result = Repository::from_descriptor("main", "/srv", descriptor);
        assert!(matches!(result, Err(Error::FormatError(_))));
    }

    #[test]
    fn test_lookup_unknown_name() {
        let catalog = catalog();
        assert!(catalog.lookup("definitely-not-a-package").unwrap().is_none());
        match catalog.lookup("libssl").unwrap().unwrap() {
            PackageCandidate::Remote(entry) => assert_eq!(entry.info.name, "openssl"),
            PackageCandidate::Local { .. } => panic!("expected a remote candidate"),
        }
    }

    #[test]
    fn test_unsynced_repository_loads_empty() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = RepositoryConfig {
            name: "main".to_string(),
            source: "/srv/main".to_string(),
            disabled: false,
        };
        let repo = Repository::load(temp.path(), &config).unwrap();
        assert!(repo.entries.is_empty());
    }
}
