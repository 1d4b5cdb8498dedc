// src/db/mod.rs

//! Installed-state registry for BPM
//!
//! Every installed package owns one directory under
//! `<root>/var/lib/bpm/installed/<name>/` holding:
//! - `info`: package metadata, same format as `pkg.info`
//! - `files`: file manifest, same format as `pkg.files`
//! - `local`: installation reason and timestamps
//! - `pre_remove.sh` / `post_remove.sh`: removal scripts, when shipped
//!
//! Nothing is cached between calls: external processes may change the
//! registry between operations, so every query reads from disk.

pub mod models;

use crate::error::{Error, Result};
use crate::packages::manifest::{self, PackageFileEntry};
use crate::packages::{BpmPackage, LifecycleScript, PackageInfo};
use models::{InstallationReason, LocalMetadata};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// State directory relative to the root
pub const BPM_DIR: &str = "var/lib/bpm";
/// Installed package records relative to the root
pub const INSTALLED_DIR: &str = "var/lib/bpm/installed";
/// Synced repository descriptors relative to the root
pub const DATABASES_DIR: &str = "var/lib/bpm/databases";
/// Fetched archive cache relative to the root
pub const CACHE_DIR: &str = "var/cache/bpm/fetched";

const INFO_FILE: &str = "info";
const FILES_FILE: &str = "files";

/// Scripts copied into the registry so they can run at removal time
pub const STORED_SCRIPTS: [LifecycleScript; 2] = [LifecycleScript::PreRemove, LifecycleScript::PostRemove];

/// Handle on the installed-state registry of one root
#[derive(Debug, Clone)]
pub struct Database {
    root: PathBuf,
}

/// Initialize the registry directories under `root`
///
/// This is idempotent - calling it on an existing root is safe.
pub fn init(root: &Path) -> Result<Database> {
    debug!("Initializing registry under: {}", root.display());

    let installed = root.join(INSTALLED_DIR);
    fs::create_dir_all(&installed).map_err(|e| {
        Error::IoError(format!(
            "Failed to create registry directory {}: {}",
            installed.display(),
            e
        ))
    })?;

    info!("Registry initialized under {}", root.display());
    Ok(Database {
        root: root.to_path_buf(),
    })
}

/// Open the registry of an existing root
///
/// The registry directories themselves may be missing: a root nothing was
/// ever installed into simply has no installed packages.
pub fn open(root: &Path) -> Result<Database> {
    if !root.is_dir() {
        return Err(Error::DatabaseNotFound(root.display().to_string()));
    }

    Ok(Database {
        root: root.to_path_buf(),
    })
}

impl Database {
    /// The target root this registry describes
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one record per installed package
    pub fn installed_dir(&self) -> PathBuf {
        self.root.join(INSTALLED_DIR)
    }

    /// Record directory of one package
    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.installed_dir().join(name)
    }

    /// Names of all installed packages, sorted
    pub fn installed_names(&self) -> Result<Vec<String>> {
        let dir = self.installed_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().join(INFO_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Whether a package with exactly this name is installed
    pub fn is_installed(&self, name: &str) -> bool {
        self.package_dir(name).join(INFO_FILE).is_file()
    }

    /// Metadata of an installed package
    pub fn get_info(&self, name: &str) -> Result<Option<PackageInfo>> {
        let path = self.package_dir(name).join(INFO_FILE);
        if !path.is_file() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        Ok(Some(PackageInfo::parse(&content)?))
    }

    /// Manifest of an installed package
    ///
    /// Records written by older versions may contain bare paths, so the
    /// manifest is read in legacy mode.
    pub fn get_files(&self, name: &str) -> Result<Vec<PackageFileEntry>> {
        let path = self.package_dir(name).join(FILES_FILE);
        if !path.is_file() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path)?;
        manifest::parse_manifest(&content, true)
    }

    /// Metadata and manifest of an installed package
    pub fn get_package(&self, name: &str) -> Result<Option<BpmPackage>> {
        match self.get_info(name)? {
            Some(info) => Ok(Some(BpmPackage::new(info, self.get_files(name)?))),
            None => Ok(None),
        }
    }

    /// Metadata of every installed package
    pub fn installed_infos(&self) -> Result<Vec<PackageInfo>> {
        let mut infos = Vec::new();
        for name in self.installed_names()? {
            if let Some(info) = self.get_info(&name)? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    /// Installed package satisfying `name`, exactly or through `provides`
    pub fn provider_of(&self, name: &str) -> Result<Option<String>> {
        if self.is_installed(name) {
            return Ok(Some(name.to_string()));
        }

        for info in self.installed_infos()? {
            if info.satisfies(name) {
                return Ok(Some(info.name));
            }
        }

        Ok(None)
    }

    /// Whether the root already satisfies `name`
    pub fn is_provided(&self, name: &str) -> Result<bool> {
        Ok(self.provider_of(name)?.is_some())
    }

    /// Write (or overwrite) the record of an installed package
    ///
    /// Removal scripts from `scripts` are stored alongside; stale ones from a
    /// previous version are dropped.
    pub fn write_package(
        &self,
        package: &BpmPackage,
        scripts: &[(LifecycleScript, Vec<u8>)],
    ) -> Result<()> {
        let name = &package.info.name;
        validate_name(name)?;

        let dir = self.package_dir(name);
        fs::create_dir_all(&dir)?;

        fs::write(dir.join(INFO_FILE), package.info.to_yaml()?)?;
        fs::write(dir.join(FILES_FILE), manifest::format_manifest(&package.files))?;

        for script in STORED_SCRIPTS {
            let path = dir.join(script.file_name());
            match scripts.iter().find(|(kind, _)| *kind == script) {
                Some((_, content)) => fs::write(&path, content)?,
                None if path.exists() => fs::remove_file(&path)?,
                None => {}
            }
        }

        debug!("Wrote registry record for {} {}", name, package.info.full_version());
        Ok(())
    }

    /// Removal script stored for an installed package
    pub fn read_script(&self, name: &str, script: LifecycleScript) -> Result<Option<Vec<u8>>> {
        let path = self.package_dir(name).join(script.file_name());
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read(&path)?))
    }

    /// Delete the record of a package
    pub fn delete_package(&self, name: &str) -> Result<()> {
        validate_name(name)?;

        let dir = self.package_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!("Deleted registry record for {}", name);
        }
        Ok(())
    }

    /// Map of path -> owning packages, skipping the `excluding` packages
    pub fn file_owners(&self, excluding: &[&str]) -> Result<BTreeMap<String, Vec<String>>> {
        let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for name in self.installed_names()? {
            if excluding.contains(&name.as_str()) {
                continue;
            }
            for entry in self.get_files(&name)? {
                owners.entry(entry.path).or_default().push(name.clone());
            }
        }

        Ok(owners)
    }

    /// Installed packages whose runtime dependencies name `name` or one of
    /// its `provides`
    pub fn dependants(&self, name: &str) -> Result<Vec<String>> {
        let target = match self.get_info(name)? {
            Some(info) => info,
            None => return Ok(Vec::new()),
        };

        let mut satisfied: HashSet<String> = target
            .provides
            .iter()
            .map(|p| crate::packages::info::normalize_name(p))
            .collect();
        satisfied.insert(crate::packages::info::normalize_name(&target.name));

        let mut dependants = Vec::new();
        for info in self.installed_infos()? {
            if info.name == target.name {
                continue;
            }
            if info
                .runtime_dependencies()
                .iter()
                .any(|dep| satisfied.contains(dep))
            {
                dependants.push(info.name);
            }
        }

        Ok(dependants)
    }

    /// Sum of manifest sizes of an installed package, 0 if not installed
    pub fn installed_size(&self, name: &str) -> Result<u64> {
        Ok(self.get_files(name)?.iter().map(|f| f.size).sum())
    }

    /// Installation reason of a package
    pub fn installation_reason(&self, name: &str) -> Result<InstallationReason> {
        Ok(LocalMetadata::find_by_name(self, name)?.installation_reason)
    }

    /// Update the local metadata of `name` after its record was written
    ///
    /// A fresh record gets an install time and reason `manual`, an upgraded
    /// one an update time with its reason kept. A given `reason` overrides
    /// either; `optional_for` notes the package that pulled this one in as an
    /// optional dependency.
    pub fn record_installation(
        &self,
        name: &str,
        upgrade: bool,
        reason: Option<InstallationReason>,
        optional_for: Option<&str>,
    ) -> Result<LocalMetadata> {
        let mut local = if upgrade {
            let mut local = LocalMetadata::find_by_name(self, name)?;
            local.touch_update();
            local
        } else {
            LocalMetadata::new(InstallationReason::Manual)
        };

        if let Some(reason) = reason {
            local.installation_reason = reason;
        }
        if let Some(dependent) = optional_for {
            if !local.optional_for.iter().any(|d| d == dependent) {
                local.optional_for.push(dependent.to_string());
            }
        }

        local.save(self, name)?;
        Ok(local)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::FormatError(format!("Invalid package name: '{}'", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(name: &str, extra: &str) -> PackageInfo {
        PackageInfo::parse(&format!(
            "name: {}\ndescription: test\nversion: \"1.0\"\nrevision: 1\narch: any\ntype: binary\n{}",
            name, extra
        ))
        .unwrap()
    }

    fn install(db: &Database, name: &str, extra: &str, files: Vec<PackageFileEntry>) {
        db.write_package(&BpmPackage::new(info(name, extra), files), &[])
            .unwrap();
    }

    #[test]
    fn test_open_nonexistent_root() {
        let result = open(Path::new("/nonexistent/path/root"));
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }

    #[test]
    fn test_empty_root_has_no_packages() {
        let temp = TempDir::new().unwrap();
        let db = open(temp.path()).unwrap();
        assert!(db.installed_names().unwrap().is_empty());
        assert!(!db.is_installed("hello"));
    }

    #[test]
    fn test_write_and_read_package() {
        let temp = TempDir::new().unwrap();
        let db = init(temp.path()).unwrap();

        let files = vec![
            PackageFileEntry::directory("usr/bin", 0o755),
            PackageFileEntry::file("usr/bin/hello", 0o755, 42),
        ];
        install(&db, "hello", "", files.clone());

        let pkg = db.get_package("hello").unwrap().unwrap();
        assert_eq!(pkg.info.full_version(), "1.0-1");
        assert_eq!(pkg.files, files);
        assert_eq!(db.installed_size("hello").unwrap(), 42);
        assert_eq!(db.installed_names().unwrap(), vec!["hello"]);
    }

    #[test]
    fn test_provider_lookup() {
        let temp = TempDir::new().unwrap();
        let db = init(temp.path()).unwrap();
        install(&db, "openssl", "provides: [libssl]\n", Vec::new());

        assert_eq!(db.provider_of("libssl").unwrap().as_deref(), Some("openssl"));
        assert!(db.is_provided("openssl").unwrap());
        assert!(!db.is_provided("gnutls").unwrap());
    }

    #[test]
    fn test_file_owners_excluding() {
        let temp = TempDir::new().unwrap();
        let db = init(temp.path()).unwrap();
        install(&db, "p", "", vec![PackageFileEntry::file("usr/bin/x", 0o755, 1)]);
        install(&db, "q", "", vec![PackageFileEntry::file("usr/bin/x", 0o755, 1)]);

        let owners = db.file_owners(&["p"]).unwrap();
        assert_eq!(owners.get("usr/bin/x").unwrap(), &vec!["q".to_string()]);

        let owners = db.file_owners(&["p", "q"]).unwrap();
        assert!(owners.get("usr/bin/x").is_none());
    }

    #[test]
    fn test_dependants_through_provides() {
        let temp = TempDir::new().unwrap();
        let db = init(temp.path()).unwrap();
        install(&db, "openssl", "provides: [libssl]\n", Vec::new());
        install(&db, "curl", "depends: [libssl]\n", Vec::new());
        install(&db, "wget", "depends: [openssl]\n", Vec::new());

        assert_eq!(db.dependants("openssl").unwrap(), vec!["curl", "wget"]);
        assert!(db.dependants("curl").unwrap().is_empty());
    }

    #[test]
    fn test_stored_scripts_replaced() {
        let temp = TempDir::new().unwrap();
        let db = init(temp.path()).unwrap();
        let pkg = BpmPackage::new(info("hello", ""), Vec::new());

        db.write_package(&pkg, &[(LifecycleScript::PostRemove, b"echo bye\n".to_vec())])
            .unwrap();
        assert!(db.read_script("hello", LifecycleScript::PostRemove).unwrap().is_some());

        db.write_package(&pkg, &[]).unwrap();
        assert!(db.read_script("hello", LifecycleScript::PostRemove).unwrap().is_none());
    }

    #[test]
    fn test_delete_package() {
        let temp = TempDir::new().unwrap();
        let db = init(temp.path()).unwrap();
        install(&db, "hello", "", Vec::new());
        db.record_installation("hello", false, None, None).unwrap();

        db.delete_package("hello").unwrap();
        assert!(!db.is_installed("hello"));
        assert!(!db.package_dir("hello").exists());
    }

    #[test]
    fn test_record_installation() {
        let temp = TempDir::new().unwrap();
        let db = init(temp.path()).unwrap();
        install(&db, "py", "", Vec::new());

        let local = db
            .record_installation("py", false, Some(InstallationReason::Dependency), Some("app"))
            .unwrap();
        assert!(local.install_time.is_some());
        assert!(local.update_time.is_none());

        // An upgrade keeps the reason and does not repeat a dependent
        let local = db.record_installation("py", true, None, Some("app")).unwrap();
        assert_eq!(local.installation_reason, InstallationReason::Dependency);
        assert_eq!(local.optional_for, vec!["app"]);
        assert!(local.update_time.is_some());
        assert_eq!(
            LocalMetadata::find_by_name(&db, "py").unwrap().optional_for,
            vec!["app"]
        );
    }

    #[test]
    fn test_invalid_name_rejected() {
        let temp = TempDir::new().unwrap();
        let db = init(temp.path()).unwrap();
        assert!(db.delete_package("../etc").is_err());
    }
}
