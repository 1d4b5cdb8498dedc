// src/db/models.rs

//! Mutable local metadata kept next to each installed package
//!
//! The `local` file holds what can change after installation: why the
//! package is present and when it was installed or last updated.

use crate::db::Database;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::str::FromStr;

/// File name of the local metadata document
pub const LOCAL_FILE: &str = "local";

/// Why a package is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallationReason {
    Manual,
    Dependency,
    #[default]
    Unknown,
}

impl InstallationReason {
    pub fn as_str(&self) -> &str {
        match self {
            InstallationReason::Manual => "manual",
            InstallationReason::Dependency => "dependency",
            InstallationReason::Unknown => "unknown",
        }
    }
}

impl FromStr for InstallationReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(InstallationReason::Manual),
            "dependency" => Ok(InstallationReason::Dependency),
            "unknown" => Ok(InstallationReason::Unknown),
            _ => Err(format!("Invalid installation reason: {}", s)),
        }
    }
}

impl fmt::Display for InstallationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contents of `installed/<name>/local`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMetadata {
    #[serde(default)]
    pub installation_reason: InstallationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
    /// Packages this one was installed for as an optional dependency
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_for: Vec<String>,
}

impl LocalMetadata {
    /// Create metadata for a freshly installed package
    pub fn new(installation_reason: InstallationReason) -> Self {
        Self {
            installation_reason,
            install_time: Some(current_timestamp()),
            update_time: None,
            optional_for: Vec::new(),
        }
    }

    /// Load the local metadata of an installed package
    ///
    /// A missing file reads as reason `unknown` without timestamps.
    pub fn find_by_name(db: &Database, name: &str) -> Result<Self> {
        let path = db.package_dir(name).join(LOCAL_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&content).map_err(|e| {
            Error::FormatError(format!("Invalid local metadata for {}: {}", name, e))
        })
    }

    /// Write this metadata for an installed package
    pub fn save(&self, db: &Database, name: &str) -> Result<()> {
        let dir = db.package_dir(name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(LOCAL_FILE), serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Record an update of the package
    pub fn touch_update(&mut self) {
        self.update_time = Some(current_timestamp());
    }
}

/// Get current timestamp as ISO 8601 string
pub fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
