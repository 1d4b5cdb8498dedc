// src/resolver/mod.rs

//! Dependency resolution against a catalog
//!
//! Expands a package's dependency graph depth-first into an install order
//! where every dependency precedes its dependents. Names with no catalog
//! entry and no virtual-package provider are reported as unresolved rather
//! than failing the whole resolution.

use crate::db::Database;
use crate::error::Result;
use crate::packages::{PackageInfo, PackageType};
use crate::packages::info::normalize_name;
use crate::repository::Catalog;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Which dependency classes to follow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Follow make and check dependencies of the package being resolved
    pub include_make: bool,
    /// Follow optional dependencies
    pub include_optional: bool,
    /// Skip names the target root already provides
    pub ignore_installed: bool,
}

/// Edge type a dependency was first reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyClass {
    Runtime,
    Make,
    Optional,
}

/// Outcome of resolving one package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Install order; the resolved package itself comes last
    pub resolved: Vec<String>,
    /// Names no catalog entry or provider could be found for
    pub unresolved: Vec<String>,
    /// Class of the edge each resolved dependency was first reached through
    pub classes: HashMap<String, DependencyClass>,
}

/// Resolves dependencies against one catalog and one root
pub struct Resolver<'a> {
    catalog: &'a Catalog,
    db: &'a Database,
}

/// Traversal state shared by the recursion
struct Walk {
    resolution: Resolution,
    /// Names currently being expanded, used for cycle detection
    stack: Vec<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a Catalog, db: &'a Database) -> Self {
        Self { catalog, db }
    }

    /// Resolve the dependency graph rooted at `info`
    pub fn resolve(&self, info: &PackageInfo, options: &ResolveOptions) -> Result<Resolution> {
        let mut walk = Walk {
            resolution: Resolution::default(),
            stack: Vec::new(),
        };

        self.visit(info, options, &mut walk, true)?;

        debug!(
            "Resolved {}: {} to install, {} unresolved",
            info.name,
            walk.resolution.resolved.len(),
            walk.resolution.unresolved.len()
        );
        Ok(walk.resolution)
    }

    fn visit(
        &self,
        info: &PackageInfo,
        options: &ResolveOptions,
        walk: &mut Walk,
        is_root: bool,
    ) -> Result<()> {
        let name = normalize_name(&info.name);
        walk.stack.push(name.clone());

        // Make and optional classes only apply to the package being resolved;
        // packages reached through it contribute their runtime dependencies.
        // Source packages always need their make and check dependencies.
        let include_make =
            is_root && (options.include_make || info.package_type == PackageType::Source);
        let mut edges: Vec<(String, DependencyClass)> = info
            .runtime_dependencies()
            .into_iter()
            .map(|d| (d, DependencyClass::Runtime))
            .collect();
        if include_make {
            edges.extend(
                info.build_dependencies()
                    .into_iter()
                    .map(|d| (d, DependencyClass::Make)),
            );
        }
        if is_root && options.include_optional {
            edges.extend(
                info.optional_dependencies()
                    .into_iter()
                    .map(|d| (d.name, DependencyClass::Optional)),
            );
        }

        for (depend, class) in edges {
            if depend.is_empty() || walk.resolution.resolved.contains(&depend) {
                continue;
            }

            if walk.stack.contains(&depend) {
                warn!(
                    "Circular dependency detected: {} -> {}, installing {} first",
                    name, depend, depend
                );
                walk.resolution.resolved.push(depend.clone());
                walk.resolution.classes.entry(depend).or_insert(class);
                continue;
            }

            if options.ignore_installed && self.db.is_provided(&depend)? {
                continue;
            }

            let entry = match self.catalog.resolve(&depend) {
                Some(entry) => entry,
                None => {
                    if !walk.resolution.unresolved.contains(&depend) {
                        walk.resolution.unresolved.push(depend);
                    }
                    continue;
                }
            };

            // A virtual name resolves to its provider's real name
            let real_name = normalize_name(&entry.info.name);
            if walk.resolution.resolved.contains(&real_name) || walk.stack.contains(&real_name) {
                continue;
            }

            self.visit(&entry.info, options, walk, false)?;
            walk.resolution.classes.entry(real_name).or_insert(class);
        }

        if !walk.resolution.resolved.contains(&name) {
            walk.resolution.resolved.push(name.clone());
        }
        walk.stack.retain(|n| n != &name);
        Ok(())
    }
}
