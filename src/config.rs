// src/config.rs

//! Configuration loaded from `/etc/bpm.conf`
//!
//! Every field has a default, so a missing file or a partial document is
//! valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bpm.conf";

/// A repository as listed in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    /// Base URL or directory the descriptor and archives are fetched from
    pub source: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host architecture override (defaults to the running machine's)
    pub architecture: Option<String>,
    /// Installed packages never touched by `update`
    pub ignore_packages: Vec<String>,
    pub install_optional_dependencies: bool,
    /// Treat make dependencies as removable during cleanup
    pub cleanup_make_dependencies: bool,
    pub run_scripts: bool,
    pub repositories: Vec<RepositoryConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            architecture: None,
            ignore_packages: Vec::new(),
            install_optional_dependencies: false,
            cleanup_make_dependencies: true,
            run_scripts: true,
            repositories: Vec::new(),
        }
    }
}

impl Config {
    /// Load the configuration, falling back to defaults when `path` is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| Error::FormatError(format!("Invalid configuration: {}", e)))
    }

    /// Architecture packages are checked against
    pub fn architecture(&self) -> String {
        self.architecture
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_string())
    }
}
