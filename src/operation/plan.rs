// src/operation/plan.rs

//! Planning entry points
//!
//! Each entry point builds a complete [`Operation`] without touching the
//! root, so a failed plan never leaves partial state behind.

use super::{Operation, OperationAction};
use crate::db::Database;
use crate::db::models::InstallationReason;
use crate::error::{Error, Result};
use crate::packages::info::normalize_name;
use crate::repository::{Catalog, Fetcher, PackageCandidate};
use std::cmp::Ordering;
use tracing::{debug, info, warn};

/// Which already installed packages an install plans again
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReinstallPolicy {
    /// Skip requested packages installed at the same version
    #[default]
    None,
    /// Reinstall the requested packages
    Reinstall,
    /// Reinstall the requested packages and all their dependencies
    ReinstallAll,
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Reason recorded for the requested packages
    pub reason: Option<InstallationReason>,
    pub reinstall: ReinstallPolicy,
    pub include_optional: bool,
    /// Downgrade missing packages and conflicts to warnings
    pub force: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Keep requested packages other packages still depend on
    pub unused_only: bool,
    /// Also remove packages orphaned by this removal
    pub cleanup: bool,
    pub cleanup_make_dependencies: bool,
    pub keep_optional: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub include_optional: bool,
    pub force: bool,
    /// Installed packages left at their current version
    pub ignore_packages: Vec<String>,
    pub verbose: bool,
}

/// Plan the installation of `names`, each a package name or archive path
pub fn plan_install<'a>(
    db: &Database,
    catalog: &'a Catalog,
    names: &[String],
    options: &InstallOptions,
) -> Result<Operation<'a>> {
    let mut operation = Operation::new(db.clone(), catalog).with_forced_reason(options.reason);

    for name in names {
        let candidate = match catalog.lookup(name)? {
            Some(candidate) => candidate,
            None => {
                let message = format!("Package {} is not in any repository", name);
                if options.force {
                    warn!("{}, skipping", message);
                    continue;
                }
                return Err(Error::NotFoundError(message));
            }
        };

        let info = candidate.info();
        if options.reinstall == ReinstallPolicy::None {
            if let Some(installed) = db.get_info(&info.name)? {
                if installed.compare_version(info) == Ordering::Equal {
                    info!(
                        "{} {} is already installed, skipping",
                        installed.name,
                        installed.full_version()
                    );
                    continue;
                }
            }
        }

        if operation.contains_package(&info.name) {
            debug!("{} requested more than once", info.name);
            continue;
        }

        let action = match candidate {
            PackageCandidate::Local { path, package } => OperationAction::Install {
                archive: path,
                is_dependency: false,
                package,
            },
            PackageCandidate::Remote(entry) => OperationAction::Fetch {
                is_dependency: false,
                entry,
            },
        };
        operation.append_action(action)?;
    }

    operation.resolve_dependencies(
        options.reinstall == ReinstallPolicy::ReinstallAll,
        options.include_optional,
        options.verbose,
    )?;
    operation.replace_obsolete_packages()?;
    enforce_resolved(&operation, options.force)?;
    enforce_no_conflicts(&operation, options.force)?;

    Ok(operation)
}

/// Plan the removal of the installed packages `names`
pub fn plan_remove<'a>(
    db: &Database,
    catalog: &'a Catalog,
    names: &[String],
    options: &RemoveOptions,
) -> Result<Operation<'a>> {
    let mut operation = Operation::new(db.clone(), catalog);

    for name in names {
        let name = normalize_name(name);
        let package = db
            .get_package(&name)?
            .ok_or_else(|| Error::NotFoundError(format!("Package {} is not installed", name)))?;
        if operation.contains_package(&package.info.name) {
            continue;
        }
        operation.append_action(OperationAction::Remove { package })?;
    }

    if options.unused_only {
        operation.remove_needed_packages()?;
    } else {
        let removing: Vec<String> = operation
            .actions()
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        for name in &removing {
            let broken: Vec<String> = db
                .dependants(name)?
                .into_iter()
                .filter(|d| !removing.contains(d))
                .collect();
            if !broken.is_empty() {
                warn!("Removing {} breaks {}", name, broken.join(", "));
            }
        }
    }

    if options.cleanup {
        operation.cleanup(options.cleanup_make_dependencies, options.keep_optional)?;
    }

    Ok(operation)
}

/// Plan the removal of every orphaned package
pub fn plan_cleanup<'a>(
    db: &Database,
    catalog: &'a Catalog,
    cleanup_make_dependencies: bool,
    keep_optional: bool,
) -> Result<Operation<'a>> {
    let mut operation = Operation::new(db.clone(), catalog);
    operation.cleanup(cleanup_make_dependencies, keep_optional)?;
    Ok(operation)
}

/// Plan the update of every installed package the catalog has a newer
/// version of
///
/// With `sync` set, the catalog's descriptors are refreshed first. Installed
/// packages another entry `replaces` are swapped for that entry.
pub fn plan_update<'a>(
    db: &Database,
    catalog: &'a mut Catalog,
    sync: Option<&dyn Fetcher>,
    options: &UpdateOptions,
) -> Result<Operation<'a>> {
    if let Some(fetcher) = sync {
        let count = catalog.sync(fetcher, db.root())?;
        info!("Synchronized {} catalog entries", count);
    }
    let catalog: &'a Catalog = catalog;

    let mut operation = Operation::new(db.clone(), catalog);

    for name in db.installed_names()? {
        if options
            .ignore_packages
            .iter()
            .any(|ignored| normalize_name(ignored) == normalize_name(&name))
        {
            info!("Skipping ignored package {}", name);
            continue;
        }

        let installed = match db.get_info(&name)? {
            Some(info) => info,
            None => continue,
        };

        if let Some(replacement) = catalog.find_replacement(&name) {
            if !db.is_installed(&replacement.info.name)
                && !operation.contains_package(&replacement.info.name)
            {
                info!("{} is replaced by {}", name, replacement.info.name);
                operation.append_action(OperationAction::Fetch {
                    is_dependency: false,
                    entry: replacement.clone(),
                })?;
            }
            continue;
        }

        let entry = match catalog.find_entry(&name) {
            Some(entry) => entry,
            None => {
                debug!("{} is not in any repository", name);
                continue;
            }
        };

        if entry.info.compare_version(&installed) == Ordering::Greater
            && !operation.contains_package(&entry.info.name)
        {
            if options.verbose {
                info!(
                    "{} {} -> {}",
                    name,
                    installed.full_version(),
                    entry.info.full_version()
                );
            }
            operation.append_action(OperationAction::Fetch {
                is_dependency: false,
                entry: entry.clone(),
            })?;
        }
    }

    operation.resolve_dependencies(false, options.include_optional, options.verbose)?;
    operation.replace_obsolete_packages()?;
    enforce_resolved(&operation, options.force)?;
    enforce_no_conflicts(&operation, options.force)?;

    Ok(operation)
}

fn enforce_resolved(operation: &Operation<'_>, force: bool) -> Result<()> {
    if operation.unresolved_depends().is_empty() {
        return Ok(());
    }

    let message = format!(
        "Dependencies not found: {}",
        operation.unresolved_depends().join(", ")
    );
    if force {
        warn!("{}", message);
        Ok(())
    } else {
        Err(Error::NotFoundError(message))
    }
}

fn enforce_no_conflicts(operation: &Operation<'_>, force: bool) -> Result<()> {
    let conflicts = operation.check_for_conflicts()?;
    if conflicts.is_empty() {
        return Ok(());
    }

    let message = conflicts
        .iter()
        .map(|(package, others)| format!("{} conflicts with {}", package, others.join(", ")))
        .collect::<Vec<_>>()
        .join("; ");
    if force {
        warn!("{}", message);
        Ok(())
    } else {
        Err(Error::ConflictError(message))
    }
}
