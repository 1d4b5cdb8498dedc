// src/operation/execute.rs

//! Applying a planned operation to its root
//!
//! Fetches are realised first, then every removal runs followed by every
//! install, each in list order. The first failure stops the run; actions
//! already applied stay applied.

use super::scripts::ScriptRunner;
use super::{ChangeMap, Operation, OperationAction};
use crate::db::{CACHE_DIR, STORED_SCRIPTS};
use crate::db::models::InstallationReason;
use crate::error::{Error, Result};
use crate::filesystem;
use crate::packages::archive;
use crate::packages::{BpmPackage, LifecycleScript, PackageType};
use crate::repository::Fetcher;
use crate::resolver::DependencyClass;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

impl Operation<'_> {
    /// Retrieve every pending fetch into the root's archive cache
    ///
    /// Each `Fetch` is turned into an `Install` of the retrieved archive in
    /// place, so the list order is unchanged.
    pub fn fetch_packages(&mut self, fetcher: &dyn Fetcher) -> Result<()> {
        let cache = self.db.root().join(CACHE_DIR);
        fs::create_dir_all(&cache).map_err(|e| {
            Error::IoError(format!("Failed to create cache {}: {}", cache.display(), e))
        })?;

        for action in self.actions.iter_mut() {
            let OperationAction::Fetch { is_dependency, entry } = action else {
                continue;
            };
            let is_dependency = *is_dependency;

            info!("Fetching {} {}", entry.info.name, entry.info.full_version());
            let path = fetcher.fetch_archive(entry, &cache)?;
            let package = BpmPackage::read_archive(&path)?;

            if package.info.name != entry.info.name {
                let is_split_parent = package
                    .info
                    .split_package_infos()?
                    .iter()
                    .any(|split| split.name == entry.info.name);
                if is_split_parent {
                    return Err(Error::Unsupported(format!(
                        "Archive {} holds {}, not its split package {}",
                        path.display(),
                        package.info.name,
                        entry.info.name
                    )));
                }
                return Err(Error::FormatError(format!(
                    "Archive {} holds {} instead of {}",
                    path.display(),
                    package.info.name,
                    entry.info.name
                )));
            }

            *action = OperationAction::Install {
                archive: path,
                is_dependency,
                package,
            };
        }

        Ok(())
    }

    /// Apply the operation and return its change map
    ///
    /// Leftover fetches, source archives and, unless `force` is set,
    /// packages for another architecture are rejected before anything is
    /// touched.
    pub fn execute(self, verbose: bool, force: bool) -> Result<ChangeMap> {
        self.preflight(force)?;

        for action in &self.actions {
            if let OperationAction::Remove { package } = action {
                self.remove_package(package, verbose)
                    .map_err(|e| Error::ActionFailed {
                        action: "remove",
                        package: package.info.name.clone(),
                        source: Box::new(e),
                    })?;
            }
        }

        for action in &self.actions {
            if let OperationAction::Install {
                archive,
                is_dependency,
                package,
            } = action
            {
                self.install_package(archive, package, *is_dependency, verbose)
                    .map_err(|e| Error::ActionFailed {
                        action: "install",
                        package: package.info.name.clone(),
                        source: Box::new(e),
                    })?;
            }
        }

        info!("Operation complete: {} change(s)", self.changes.len());
        Ok(self.changes)
    }

    fn preflight(&self, force: bool) -> Result<()> {
        for action in &self.actions {
            match action {
                OperationAction::Fetch { entry, .. } => {
                    return Err(Error::Unsupported(format!(
                        "Package {} has not been fetched",
                        entry.info.name
                    )));
                }
                OperationAction::Install { package, .. } => {
                    let info = &package.info;
                    if info.package_type == PackageType::Source {
                        return Err(Error::Unsupported(format!(
                            "Package {} is a source package; building is not supported",
                            info.name
                        )));
                    }
                    if !info.fits_architecture(&self.architecture) {
                        let error = Error::ArchitectureMismatch {
                            package: info.name.clone(),
                            expected: self.architecture.clone(),
                            found: info.arch.clone(),
                        };
                        if !force {
                            return Err(error);
                        }
                        warn!("{}", error);
                    }
                }
                OperationAction::Remove { .. } => {}
            }
        }
        Ok(())
    }

    fn remove_package(&self, package: &BpmPackage, verbose: bool) -> Result<()> {
        let name = &package.info.name;
        info!("Removing {} {}", name, package.info.full_version());

        let runner = ScriptRunner::new(self.db.root(), &package.info);
        let (pre_remove, post_remove) = if self.run_scripts {
            (
                self.db.read_script(name, LifecycleScript::PreRemove)?,
                self.db.read_script(name, LifecycleScript::PostRemove)?,
            )
        } else {
            (None, None)
        };
        runner.run_optional(LifecycleScript::PreRemove, pre_remove.as_deref())?;

        let owners = self.db.file_owners(&[name.as_str()])?;
        let files = self.db.get_files(name)?;
        if verbose {
            info!("Removing {} path(s) of {}", files.len(), name);
        }
        filesystem::remove_files(self.db.root(), &files, &owners, &[])?;

        self.db.delete_package(name)?;
        runner.run_optional(LifecycleScript::PostRemove, post_remove.as_deref())?;

        debug!("Removed {}", name);
        Ok(())
    }

    fn install_package(
        &self,
        archive_path: &Path,
        package: &BpmPackage,
        is_dependency: bool,
        verbose: bool,
    ) -> Result<()> {
        let name = &package.info.name;
        let previous = self.db.get_package(name)?;
        let (pre, post) = match &previous {
            Some(old) => {
                info!(
                    "Upgrading {} {} -> {}",
                    name,
                    old.info.full_version(),
                    package.info.full_version()
                );
                (LifecycleScript::PreUpdate, LifecycleScript::PostUpdate)
            }
            None => {
                info!("Installing {} {}", name, package.info.full_version());
                (LifecycleScript::PreInstall, LifecycleScript::PostInstall)
            }
        };

        let runner = ScriptRunner::new(self.db.root(), &package.info);
        if self.run_scripts {
            let script = archive::read_script(archive_path, pre)?;
            runner.run_optional(pre, script.as_deref())?;
        }

        if let Some(old) = &previous {
            let owners = self.db.file_owners(&[name.as_str()])?;
            filesystem::remove_files(self.db.root(), &old.files, &owners, &package.info.keep)?;
        }

        let extracted =
            filesystem::extract_files(archive_path, self.db.root(), &package.files, &package.info.keep)?;
        if verbose {
            info!("Extracted {} path(s) of {}", extracted, name);
        }

        let mut stored = Vec::new();
        for script in STORED_SCRIPTS {
            if let Some(content) = archive::read_script(archive_path, script)? {
                stored.push((script, content));
            }
        }
        self.db.write_package(package, &stored)?;

        let reason = match (is_dependency, previous.is_some(), self.forced_reason) {
            (false, _, Some(reason)) => Some(reason),
            (true, false, _) => Some(InstallationReason::Dependency),
            (false, false, None) => Some(InstallationReason::Manual),
            _ => None,
        };
        let optional_for = self
            .links
            .get(name)
            .filter(|link| is_dependency && link.class == DependencyClass::Optional)
            .map(|link| link.dependent.as_str());
        let local = self
            .db
            .record_installation(name, previous.is_some(), reason, optional_for)?;

        if self.run_scripts {
            let script = archive::read_script(archive_path, post)?;
            runner.run_optional(post, script.as_deref())?;
        }

        debug!("Installed {} as {}", name, local.installation_reason);
        Ok(())
    }
}
