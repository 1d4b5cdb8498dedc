// src/packages/info.rs

//! Package metadata (`pkg.info` inside archives, `info` in the registry)

use crate::error::{Error, Result};
use crate::version;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Whether a package ships sources to be compiled or ready-made files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Source,
    Binary,
}

impl PackageType {
    pub fn as_str(&self) -> &str {
        match self {
            PackageType::Source => "source",
            PackageType::Binary => "binary",
        }
    }
}

impl FromStr for PackageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "source" => Ok(PackageType::Source),
            "binary" => Ok(PackageType::Binary),
            _ => Err(format!("Invalid package type: {}", s)),
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed package metadata
///
/// Immutable once parsed. Constructed through [`PackageInfo::parse`] or
/// [`PackageInfo::from_value`], both of which enforce the mandatory fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub description: String,
    pub version: String,
    pub revision: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub license: String,
    pub arch: String,
    #[serde(rename = "type")]
    pub package_type: PackageType,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keep: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub make_depends: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub optional_depends: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub check_depends: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub split_packages: Vec<Value>,
}

/// Metadata as it appears on disk, before mandatory fields are checked
#[derive(Debug, Default, Deserialize)]
struct RawPackageInfo {
    name: Option<String>,
    description: Option<String>,
    version: Option<String>,
    revision: Option<i64>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    license: String,
    arch: Option<String>,
    #[serde(rename = "type")]
    package_type: Option<String>,
    #[serde(default)]
    keep: Vec<String>,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    make_depends: Vec<String>,
    #[serde(default)]
    optional_depends: Vec<String>,
    #[serde(default)]
    check_depends: Vec<String>,
    #[serde(default)]
    conflicts: Vec<String>,
    #[serde(default)]
    replaces: Vec<String>,
    #[serde(default)]
    provides: Vec<String>,
    #[serde(default)]
    split_packages: Vec<Value>,
}

/// An optional dependency with its `name: reason` annotation split apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalDependency {
    pub name: String,
    pub reason: Option<String>,
}

/// Normalize a dependency name for lookups
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

impl PackageInfo {
    /// Parse package metadata from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawPackageInfo = serde_yaml::from_str(content)
            .map_err(|e| Error::FormatError(format!("Invalid package metadata: {}", e)))?;
        Self::from_raw(raw)
    }

    /// Build package metadata from an already parsed YAML value
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawPackageInfo = serde_yaml::from_value(value)
            .map_err(|e| Error::FormatError(format!("Invalid package metadata: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawPackageInfo) -> Result<Self> {
        fn required(field: Option<String>, key: &str) -> Result<String> {
            match field {
                Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                _ => Err(Error::FormatError(format!(
                    "Package metadata is missing mandatory field '{}'",
                    key
                ))),
            }
        }

        let name = required(raw.name, "name")?;
        let description = required(raw.description, "description")?;
        let version = required(raw.version, "version")?;
        let arch = required(raw.arch, "arch")?;
        let package_type = required(raw.package_type, "type")?
            .parse::<PackageType>()
            .map_err(Error::FormatError)?;

        let revision = match raw.revision {
            Some(revision) if revision > 0 && revision <= u32::MAX as i64 => revision as u32,
            Some(revision) => {
                return Err(Error::FormatError(format!(
                    "Package {} has invalid revision {}",
                    name, revision
                )));
            }
            None => {
                return Err(Error::FormatError(
                    "Package metadata is missing mandatory field 'revision'".to_string(),
                ));
            }
        };

        Ok(Self {
            name,
            description,
            version,
            revision,
            url: raw.url,
            license: raw.license,
            arch,
            package_type,
            keep: raw.keep,
            depends: raw.depends,
            make_depends: raw.make_depends,
            optional_depends: raw.optional_depends,
            check_depends: raw.check_depends,
            conflicts: raw.conflicts,
            replaces: raw.replaces,
            provides: raw.provides,
            split_packages: raw.split_packages,
        })
    }

    /// Serialize to the YAML form used by `pkg.info` and the registry
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// `version-revision`
    pub fn full_version(&self) -> String {
        format!("{}-{}", self.version, self.revision)
    }

    /// Compare full versions with another package
    pub fn compare_version(&self, other: &PackageInfo) -> Ordering {
        version::compare_full(&self.version, self.revision, &other.version, other.revision)
    }

    /// Optional dependencies with their annotations
    pub fn optional_dependencies(&self) -> Vec<OptionalDependency> {
        self.optional_depends
            .iter()
            .map(|entry| match entry.split_once(':') {
                Some((name, reason)) => OptionalDependency {
                    name: normalize_name(name),
                    reason: Some(reason.trim().to_string()).filter(|r| !r.is_empty()),
                },
                None => OptionalDependency {
                    name: normalize_name(entry),
                    reason: None,
                },
            })
            .collect()
    }

    /// Normalized runtime dependency names
    pub fn runtime_dependencies(&self) -> Vec<String> {
        self.depends.iter().map(|d| normalize_name(d)).collect()
    }

    /// Normalized make and check dependency names
    pub fn build_dependencies(&self) -> Vec<String> {
        self.make_depends
            .iter()
            .chain(self.check_depends.iter())
            .map(|d| normalize_name(d))
            .collect()
    }

    /// All dependency names of the requested classes, deduplicated in order
    pub fn dependencies(&self, include_make: bool, include_optional: bool) -> Vec<String> {
        let mut names = self.runtime_dependencies();
        if include_make {
            names.extend(self.build_dependencies());
        }
        if include_optional {
            names.extend(self.optional_dependencies().into_iter().map(|d| d.name));
        }

        let mut seen = std::collections::HashSet::new();
        names.retain(|n| !n.is_empty() && seen.insert(n.clone()));
        names
    }

    /// Whether this package is `name` or declares it in `provides`
    pub fn satisfies(&self, name: &str) -> bool {
        let name = normalize_name(name);
        normalize_name(&self.name) == name || self.provides.iter().any(|p| normalize_name(p) == name)
    }

    /// Expand declared split packages into standalone metadata
    ///
    /// Each split mapping is laid over the parent's fields; version, revision
    /// and url always come from the parent.
    pub fn split_package_infos(&self) -> Result<Vec<PackageInfo>> {
        if self.split_packages.is_empty() {
            return Ok(Vec::new());
        }

        let mut base = match serde_yaml::to_value(self)? {
            Value::Mapping(mapping) => mapping,
            _ => return Err(Error::FormatError("Package metadata is not a mapping".to_string())),
        };
        base.remove("split_packages");

        let mut infos = Vec::with_capacity(self.split_packages.len());
        for split in &self.split_packages {
            let overlay = split.as_mapping().ok_or_else(|| {
                Error::FormatError(format!("Split package of {} is not a mapping", self.name))
            })?;

            let mut merged: Mapping = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            merged.remove("split_packages");
            merged.insert("version".into(), Value::String(self.version.clone()));
            merged.insert("revision".into(), Value::Number(self.revision.into()));
            merged.insert("url".into(), Value::String(self.url.clone()));

            infos.push(PackageInfo::from_value(Value::Mapping(merged))?);
        }

        Ok(infos)
    }

    /// Whether this package can run on the given host architecture
    pub fn fits_architecture(&self, host: &str) -> bool {
        self.arch == "any" || self.arch == host
    }
}
