// src/operation/mod.rs

//! Operations: ordered action lists over one root
//!
//! An [`Operation`] is created empty by one of the planning entry points in
//! [`plan`], edited by the resolution, replacement and cleanup passes, then
//! consumed once by [`Operation::execute`]. The change map is kept in step
//! with the action list on every insertion and removal.

mod execute;
pub mod plan;
pub mod scripts;

pub use plan::{
    InstallOptions, ReinstallPolicy, RemoveOptions, UpdateOptions, plan_cleanup, plan_install,
    plan_remove, plan_update,
};

use crate::db::Database;
use crate::db::models::{InstallationReason, LocalMetadata};
use crate::error::{Error, Result};
use crate::packages::info::normalize_name;
use crate::packages::{BpmPackage, PackageInfo};
use crate::repository::{Catalog, CatalogEntry};
use crate::resolver::{DependencyClass, ResolveOptions, Resolver};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

/// One step of an operation
#[derive(Debug, Clone)]
pub enum OperationAction {
    /// Write a package from an archive already on disk
    Install {
        archive: PathBuf,
        is_dependency: bool,
        package: BpmPackage,
    },
    /// Retrieve a catalog entry; becomes an `Install` once fetched
    Fetch {
        is_dependency: bool,
        entry: CatalogEntry,
    },
    /// Delete an installed package
    Remove { package: BpmPackage },
}

impl OperationAction {
    pub fn info(&self) -> &PackageInfo {
        match self {
            OperationAction::Install { package, .. } | OperationAction::Remove { package } => {
                &package.info
            }
            OperationAction::Fetch { entry, .. } => &entry.info,
        }
    }

    pub fn name(&self) -> &str {
        &self.info().name
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, OperationAction::Remove { .. })
    }

    pub fn is_dependency(&self) -> bool {
        match self {
            OperationAction::Install { is_dependency, .. }
            | OperationAction::Fetch { is_dependency, .. } => *is_dependency,
            OperationAction::Remove { .. } => false,
        }
    }

    /// Short name of the action kind
    pub fn kind(&self) -> &'static str {
        match self {
            OperationAction::Install { .. } => "install",
            OperationAction::Fetch { .. } => "fetch",
            OperationAction::Remove { .. } => "remove",
        }
    }
}

/// Net effect of an operation on one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Install,
    Upgrade,
    Remove,
}

impl ChangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeKind::Install => "install",
            ChangeKind::Upgrade => "upgrade",
            ChangeKind::Remove => "remove",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package name to change, handed to hook dispatch after execution
pub type ChangeMap = BTreeMap<String, ChangeKind>;

/// Conflicting packages: package name to the names it conflicts with
pub type ConflictMap = BTreeMap<String, Vec<String>>;

/// Why a planned dependency is part of the operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyLink {
    /// Edge the dependency was first reached through
    pub class: DependencyClass,
    /// Planned package whose resolution pulled it in
    pub dependent: String,
}

/// The unit of work against one root
pub struct Operation<'a> {
    db: Database,
    catalog: &'a Catalog,
    actions: Vec<OperationAction>,
    unresolved_depends: Vec<String>,
    changes: ChangeMap,
    /// Pulled-in dependency name to the link that planned it
    links: BTreeMap<String, DependencyLink>,
    forced_reason: Option<InstallationReason>,
    architecture: String,
    run_scripts: bool,
}

impl<'a> Operation<'a> {
    pub fn new(db: Database, catalog: &'a Catalog) -> Self {
        Self {
            db,
            catalog,
            actions: Vec::new(),
            unresolved_depends: Vec::new(),
            changes: ChangeMap::new(),
            links: BTreeMap::new(),
            forced_reason: None,
            architecture: std::env::consts::ARCH.to_string(),
            run_scripts: true,
        }
    }

    /// Installation reason recorded for explicitly requested packages
    pub fn with_forced_reason(mut self, reason: Option<InstallationReason>) -> Self {
        self.forced_reason = reason;
        self
    }

    /// Host architecture packages are checked against
    pub fn with_architecture(mut self, architecture: &str) -> Self {
        self.architecture = architecture.to_string();
        self
    }

    pub fn with_scripts(mut self, run_scripts: bool) -> Self {
        self.run_scripts = run_scripts;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn actions(&self) -> &[OperationAction] {
        &self.actions
    }

    pub fn unresolved_depends(&self) -> &[String] {
        &self.unresolved_depends
    }

    pub fn changes(&self) -> &ChangeMap {
        &self.changes
    }

    /// How a pulled-in dependency entered the operation
    pub fn dependency_link(&self, name: &str) -> Option<&DependencyLink> {
        self.links.get(name)
    }

    pub fn forced_reason(&self) -> Option<InstallationReason> {
        self.forced_reason
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Whether an action for `name` is already planned
    pub fn contains_package(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        let name = normalize_name(name);
        self.actions
            .iter()
            .position(|action| normalize_name(action.name()) == name)
    }

    /// Add an action at the end of the list
    pub fn append_action(&mut self, action: OperationAction) -> Result<()> {
        let index = self.actions.len();
        self.insert_action_at(index, action)
    }

    /// Insert an action at `index`
    ///
    /// A second action for a package that is already planned is rejected.
    pub fn insert_action_at(&mut self, index: usize, action: OperationAction) -> Result<()> {
        if self.contains_package(action.name()) {
            return Err(Error::DuplicateAction(action.name().to_string()));
        }

        let change = if action.is_removal() {
            ChangeKind::Remove
        } else if self.db.is_installed(action.name()) {
            ChangeKind::Upgrade
        } else {
            ChangeKind::Install
        };
        self.changes.insert(action.name().to_string(), change);

        let index = index.min(self.actions.len());
        self.actions.insert(index, action);
        Ok(())
    }

    /// Drop the action for `name`, returning it
    pub fn remove_action(&mut self, name: &str) -> Option<OperationAction> {
        let index = self.position(name)?;
        let action = self.actions.remove(index);
        self.changes.remove(action.name());
        self.links.remove(action.name());
        Some(action)
    }

    /// Plan every missing dependency of the planned installs
    ///
    /// Each dependency becomes a `Fetch` inserted directly before the package
    /// that needs it. Names no catalog knows are collected in
    /// [`Operation::unresolved_depends`] rather than failing.
    pub fn resolve_dependencies(
        &mut self,
        reinstall_dependencies: bool,
        include_optional: bool,
        verbose: bool,
    ) -> Result<()> {
        let catalog = self.catalog;
        let options = ResolveOptions {
            include_make: false,
            include_optional,
            ignore_installed: !reinstall_dependencies,
        };

        let mut index = 0;
        while index < self.actions.len() {
            if self.actions[index].is_removal() {
                index += 1;
                continue;
            }

            let info = self.actions[index].info().clone();
            let resolution = Resolver::new(catalog, &self.db).resolve(&info, &options)?;

            for name in resolution.unresolved {
                let planned = self.actions.iter().any(|a| !a.is_removal() && a.info().satisfies(&name));
                if !planned && !self.unresolved_depends.contains(&name) {
                    self.unresolved_depends.push(name);
                }
            }

            let own_name = normalize_name(&info.name);
            let mut inserted = 0;
            for name in resolution.resolved {
                if name == own_name || self.contains_package(&name) {
                    continue;
                }
                let entry = match catalog.find_entry(&name) {
                    Some(entry) => entry.clone(),
                    None => continue,
                };
                let class = resolution
                    .classes
                    .get(&name)
                    .copied()
                    .unwrap_or(DependencyClass::Runtime);

                if verbose {
                    info!("Adding dependency {} {} for {}", entry.info.name, entry.info.full_version(), info.name);
                } else {
                    debug!("Adding dependency {} for {}", entry.info.name, info.name);
                }
                let dependency = entry.info.name.clone();
                self.insert_action_at(
                    index + inserted,
                    OperationAction::Fetch {
                        is_dependency: true,
                        entry,
                    },
                )?;
                self.links.insert(
                    dependency,
                    DependencyLink {
                        class,
                        dependent: info.name.clone(),
                    },
                );
                inserted += 1;
            }

            // The inserted fetches were expanded as part of this closure
            index += inserted + 1;
        }

        Ok(())
    }

    /// Plan the removal of installed packages named in `replaces`
    ///
    /// Removals go to the head of the list so they run before anything that
    /// replaces them.
    pub fn replace_obsolete_packages(&mut self) -> Result<()> {
        let mut obsolete: Vec<String> = Vec::new();
        for action in self.actions.iter().filter(|a| !a.is_removal()) {
            for replaced in &action.info().replaces {
                let replaced = normalize_name(replaced);
                if replaced.is_empty()
                    || !self.db.is_installed(&replaced)
                    || self.contains_package(&replaced)
                    || obsolete.contains(&replaced)
                {
                    continue;
                }
                info!("{} replaces installed package {}", action.name(), replaced);
                obsolete.push(replaced);
            }
        }

        for name in obsolete {
            let package = self
                .db
                .get_package(&name)?
                .ok_or_else(|| Error::NotFoundError(format!("Installed package {}", name)))?;
            self.insert_action_at(0, OperationAction::Remove { package })?;
        }

        Ok(())
    }

    /// Packages that would exist after this operation
    fn final_state(&self) -> Result<Vec<PackageInfo>> {
        let mut state: BTreeMap<String, PackageInfo> = BTreeMap::new();
        for info in self.db.installed_infos()? {
            state.insert(normalize_name(&info.name), info);
        }
        for action in &self.actions {
            let name = normalize_name(action.name());
            if action.is_removal() {
                state.remove(&name);
            } else {
                state.insert(name, action.info().clone());
            }
        }
        Ok(state.into_values().collect())
    }

    /// Conflicts between packages of the final state
    ///
    /// A declaration on either side is reported under the declaring package.
    /// Declared names match real names and `provides`.
    pub fn check_for_conflicts(&self) -> Result<ConflictMap> {
        let state = self.final_state()?;
        let mut conflicts = ConflictMap::new();

        for package in &state {
            let mut found: BTreeSet<String> = BTreeSet::new();
            for declared in &package.conflicts {
                for other in &state {
                    if other.name != package.name && other.satisfies(declared) {
                        found.insert(other.name.clone());
                    }
                }
            }
            if !found.is_empty() {
                conflicts.insert(package.name.clone(), found.into_iter().collect());
            }
        }

        Ok(conflicts)
    }

    /// Drop planned removals that other packages still depend on
    ///
    /// Repeats until stable, since keeping one package can keep its own
    /// dependencies.
    pub fn remove_needed_packages(&mut self) -> Result<()> {
        loop {
            let removing: HashSet<String> = self
                .actions
                .iter()
                .filter(|a| a.is_removal())
                .map(|a| a.name().to_string())
                .collect();

            let mut needed = None;
            for name in &removing {
                let dependants = self.db.dependants(name)?;
                if let Some(user) = dependants.iter().find(|d| !removing.contains(*d)) {
                    info!("Not removing {}: required by {}", name, user);
                    needed = Some(name.clone());
                    break;
                }
            }

            match needed {
                Some(name) => {
                    self.remove_action(&name);
                }
                None => return Ok(()),
            }
        }
    }

    /// Plan the removal of every orphaned package
    ///
    /// Packages not installed as a dependency are kept together with the
    /// closure of their dependencies; every other installed package not
    /// already planned for removal is removed.
    pub fn cleanup(&mut self, cleanup_make_dependencies: bool, keep_optional: bool) -> Result<()> {
        let removing: HashSet<String> = self
            .actions
            .iter()
            .filter(|a| a.is_removal())
            .map(|a| a.name().to_string())
            .collect();

        let installed: Vec<PackageInfo> = self
            .db
            .installed_infos()?
            .into_iter()
            .filter(|info| !removing.contains(&info.name))
            .collect();

        let mut queue = Vec::new();
        // Kept package name to the packages installed as its optional dependencies
        let mut optional_of: HashMap<String, Vec<String>> = HashMap::new();
        for info in &installed {
            let local = LocalMetadata::find_by_name(&self.db, &info.name)?;
            if local.installation_reason != InstallationReason::Dependency {
                queue.push(info.name.clone());
            }
            if keep_optional {
                for dependent in local.optional_for {
                    optional_of
                        .entry(dependent)
                        .or_default()
                        .push(info.name.clone());
                }
            }
        }

        let mut needed: HashSet<String> = HashSet::new();
        while let Some(name) = queue.pop() {
            if !needed.insert(name.clone()) {
                continue;
            }
            if let Some(optional) = optional_of.get(&name) {
                queue.extend(optional.iter().cloned());
            }
            let Some(info) = installed.iter().find(|i| i.name == name) else {
                continue;
            };
            for depend in info.dependencies(!cleanup_make_dependencies, keep_optional) {
                let provider = installed
                    .iter()
                    .find(|i| normalize_name(&i.name) == depend)
                    .or_else(|| installed.iter().find(|i| i.satisfies(&depend)));
                if let Some(provider) = provider {
                    queue.push(provider.name.clone());
                }
            }
        }

        for info in &installed {
            if needed.contains(&info.name) || self.contains_package(&info.name) {
                continue;
            }
            let package = self
                .db
                .get_package(&info.name)?
                .ok_or_else(|| Error::NotFoundError(format!("Installed package {}", info.name)))?;
            debug!("Planning removal of orphan {}", info.name);
            self.append_action(OperationAction::Remove { package })?;
        }

        Ok(())
    }

    /// Sum of advertised download sizes of pending fetches
    pub fn total_download_size(&self) -> u64 {
        self.actions
            .iter()
            .map(|action| match action {
                OperationAction::Fetch { entry, .. } => entry.download_size,
                _ => 0,
            })
            .sum()
    }

    /// Sum of installed sizes of everything this operation installs
    pub fn total_installed_size(&self) -> u64 {
        self.actions.iter().map(action_installed_size).sum()
    }

    /// Net change in bytes on the root once the operation completes
    ///
    /// New installs count in full, upgrades count the difference to the
    /// installed version and removals count negatively.
    pub fn final_size_delta(&self) -> Result<i64> {
        let mut delta: i64 = 0;
        for action in &self.actions {
            match action {
                OperationAction::Remove { package } => {
                    delta -= package.installed_size() as i64;
                }
                _ => {
                    delta += action_installed_size(action) as i64;
                    delta -= self.db.installed_size(action.name())? as i64;
                }
            }
        }
        Ok(delta)
    }

    /// Plain-text listing of the planned changes
    pub fn summary(&self) -> Result<String> {
        let mut out = String::new();
        for action in &self.actions {
            let info = action.info();
            let change = self
                .changes
                .get(&info.name)
                .map(|c| c.as_str())
                .unwrap_or("-");
            let version = match (change, self.db.get_info(&info.name)?) {
                ("upgrade", Some(old)) => format!("{} -> {}", old.full_version(), info.full_version()),
                _ => info.full_version(),
            };
            let size = match action {
                OperationAction::Remove { package } => package.installed_size(),
                _ => action_installed_size(action),
            };
            let reason = match self.links.get(&info.name) {
                Some(link) if link.class == DependencyClass::Optional => {
                    format!(" (optional for {})", link.dependent)
                }
                _ if action.is_dependency() => " (dependency)".to_string(),
                _ => String::new(),
            };
            out.push_str(&format!(
                "{:<8} {} {} [{}]{}\n",
                change,
                info.name,
                version,
                format_size(size),
                reason
            ));
        }

        out.push_str(&format!(
            "Download size: {}\nInstalled size: {}\nNet change: {}{}\n",
            format_size(self.total_download_size()),
            format_size(self.total_installed_size()),
            if self.final_size_delta()? < 0 { "-" } else { "" },
            format_size(self.final_size_delta()?.unsigned_abs())
        ));
        if !self.unresolved_depends.is_empty() {
            out.push_str(&format!(
                "Unresolved dependencies: {}\n",
                self.unresolved_depends.join(", ")
            ));
        }
        Ok(out)
    }
}

fn action_installed_size(action: &OperationAction) -> u64 {
    match action {
        OperationAction::Install { package, .. } => package.installed_size(),
        OperationAction::Fetch { entry, .. } => entry.installed_size,
        OperationAction::Remove { .. } => 0,
    }
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
