// src/main.rs

use anyhow::{Context, Result};
use bpm::config::{Config, DEFAULT_CONFIG_PATH};
use bpm::db::models::InstallationReason;
use bpm::lock::RootLock;
use bpm::operation::{
    InstallOptions, Operation, OperationAction, ReinstallPolicy, RemoveOptions, UpdateOptions,
    format_size, plan_cleanup, plan_install, plan_remove, plan_update,
};
use bpm::packages::BpmPackage;
use bpm::repository::{Catalog, Fetcher, RepositoryClient};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "bpm")]
#[command(author, version, about = "Package manager for file-tree rooted systems", long_about = None)]
struct Cli {
    /// Target root directory
    #[arg(short = 'R', long, global = true, default_value = "/")]
    root: PathBuf,

    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Show debug output and per-package details
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show metadata of an installed package, catalog entry or archive
    Info {
        /// Package name or archive path
        package: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List installed packages
    List {
        /// Only packages installed for this reason (manual, dependency, unknown)
        #[arg(long)]
        reason: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show which installed packages own a path
    Owner {
        /// Path inside the root
        path: String,
    },
    /// Install packages by name or from local archives
    Install {
        /// Package names or archive paths
        #[arg(required = true)]
        packages: Vec<String>,
        /// Reinstall packages already installed at the same version
        #[arg(long)]
        reinstall: bool,
        /// Reinstall dependencies as well
        #[arg(long, conflicts_with = "reinstall")]
        reinstall_all: bool,
        /// Installation reason recorded for the requested packages
        #[arg(long)]
        reason: Option<String>,
        /// Install optional dependencies too
        #[arg(long)]
        optional: bool,
        /// Continue despite missing dependencies, conflicts and foreign architectures
        #[arg(short, long)]
        force: bool,
        /// Do not run lifecycle scripts
        #[arg(long)]
        no_scripts: bool,
        /// Only show what would be done
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Remove installed packages
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,
        /// Skip packages other installed packages still depend on
        #[arg(long)]
        unused: bool,
        /// Also remove dependencies nothing needs anymore
        #[arg(long)]
        cleanup: bool,
        #[arg(long)]
        no_scripts: bool,
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Remove orphaned dependencies
    Cleanup {
        /// Keep optional dependencies of kept packages
        #[arg(long)]
        keep_optional: bool,
        #[arg(long)]
        no_scripts: bool,
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Update installed packages from the configured repositories
    Update {
        /// Synchronize repositories first
        #[arg(short, long)]
        sync: bool,
        #[arg(long)]
        optional: bool,
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        no_scripts: bool,
        #[arg(short = 'n', long)]
        dry_run: bool,
    },
    /// Synchronize repository descriptors
    Sync,
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

/// What to do with a planned operation
struct RunOptions {
    dry_run: bool,
    force: bool,
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    let root = cli.root.as_path();
    debug!("Using root {}", root.display());

    match cli.command {
        Commands::Info { package, json } => cmd_info(root, &config, &package, json),
        Commands::List { reason, json } => cmd_list(root, reason.as_deref(), json),
        Commands::Owner { path } => cmd_owner(root, &path),
        Commands::Install {
            packages,
            reinstall,
            reinstall_all,
            reason,
            optional,
            force,
            no_scripts,
            dry_run,
        } => {
            let reason = reason
                .map(|r| r.parse::<InstallationReason>())
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?;
            let reinstall = if reinstall_all {
                ReinstallPolicy::ReinstallAll
            } else if reinstall {
                ReinstallPolicy::Reinstall
            } else {
                ReinstallPolicy::None
            };

            let _lock = RootLock::acquire(root)?;
            let db = bpm::db::init(root)?;
            let catalog = Catalog::load(root, &config.repositories)?;
            let options = InstallOptions {
                reason,
                reinstall,
                include_optional: optional || config.install_optional_dependencies,
                force,
                verbose: cli.verbose,
            };
            let operation = plan_install(&db, &catalog, &packages, &options)?;
            run(
                configure(operation, &config, no_scripts),
                &RunOptions {
                    dry_run,
                    force,
                    verbose: cli.verbose,
                },
            )
        }
        Commands::Remove {
            packages,
            unused,
            cleanup,
            no_scripts,
            dry_run,
        } => {
            let _lock = RootLock::acquire(root)?;
            let db = bpm::db::open(root)?;
            let catalog = Catalog::default();
            let options = RemoveOptions {
                unused_only: unused,
                cleanup,
                cleanup_make_dependencies: config.cleanup_make_dependencies,
                keep_optional: config.install_optional_dependencies,
            };
            let operation = plan_remove(&db, &catalog, &packages, &options)?;
            run(
                configure(operation, &config, no_scripts),
                &RunOptions {
                    dry_run,
                    force: false,
                    verbose: cli.verbose,
                },
            )
        }
        Commands::Cleanup {
            keep_optional,
            no_scripts,
            dry_run,
        } => {
            let _lock = RootLock::acquire(root)?;
            let db = bpm::db::open(root)?;
            let catalog = Catalog::default();
            let operation = plan_cleanup(
                &db,
                &catalog,
                config.cleanup_make_dependencies,
                keep_optional || config.install_optional_dependencies,
            )?;
            run(
                configure(operation, &config, no_scripts),
                &RunOptions {
                    dry_run,
                    force: false,
                    verbose: cli.verbose,
                },
            )
        }
        Commands::Update {
            sync,
            optional,
            force,
            no_scripts,
            dry_run,
        } => {
            let _lock = RootLock::acquire(root)?;
            let db = bpm::db::init(root)?;
            let mut catalog = Catalog::load(root, &config.repositories)?;
            let client = RepositoryClient::new()?;
            let fetcher: Option<&dyn Fetcher> = if sync {
                Some(&client as &dyn Fetcher)
            } else {
                None
            };
            let options = UpdateOptions {
                include_optional: optional || config.install_optional_dependencies,
                force,
                ignore_packages: config.ignore_packages.clone(),
                verbose: cli.verbose,
            };
            let operation = plan_update(&db, &mut catalog, fetcher, &options)?;
            run(
                configure(operation, &config, no_scripts),
                &RunOptions {
                    dry_run,
                    force,
                    verbose: cli.verbose,
                },
            )
        }
        Commands::Sync => {
            let _lock = RootLock::acquire(root)?;
            bpm::db::init(root)?;
            let mut catalog = Catalog::load(root, &config.repositories)?;
            let client = RepositoryClient::new()?;
            let count = catalog.sync(&client, root)?;
            println!(
                "Synchronized {} repositor{} ({} packages)",
                catalog.repositories.len(),
                if catalog.repositories.len() == 1 { "y" } else { "ies" },
                count
            );
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "bpm", &mut io::stdout());
            Ok(())
        }
    }
}

fn configure<'a>(operation: Operation<'a>, config: &Config, no_scripts: bool) -> Operation<'a> {
    operation
        .with_architecture(&config.architecture())
        .with_scripts(config.run_scripts && !no_scripts)
}

/// Show, fetch and execute a planned operation
fn run(mut operation: Operation<'_>, options: &RunOptions) -> Result<()> {
    if operation.is_empty() {
        println!("Nothing to do.");
        return Ok(());
    }

    print!("{}", operation.summary()?);
    if options.dry_run {
        return Ok(());
    }

    let needs_fetch = operation
        .actions()
        .iter()
        .any(|a| matches!(a, OperationAction::Fetch { .. }));
    if needs_fetch {
        let client = RepositoryClient::new()?;
        operation.fetch_packages(&client)?;
    }

    let changes = operation.execute(options.verbose, options.force)?;
    for (name, change) in &changes {
        println!("{:<8} {}", change, name);
    }
    info!("{} package(s) changed", changes.len());
    Ok(())
}

fn cmd_info(root: &Path, config: &Config, package: &str, json: bool) -> Result<()> {
    let db = bpm::db::open(root)?;

    let (info, source, installed_size) = if Path::new(package).is_file() {
        let archive = BpmPackage::read_archive(Path::new(package))?;
        let size = archive.installed_size();
        (archive.info, format!("archive {}", package), size)
    } else if let Some(info) = db.get_info(package)? {
        let size = db.installed_size(&info.name)?;
        let reason = db.installation_reason(&info.name)?;
        (info, format!("installed ({})", reason), size)
    } else {
        let catalog = Catalog::load(root, &config.repositories)?;
        let entry = catalog
            .resolve(package)
            .with_context(|| format!("Package {} not found", package))?;
        (
            entry.info.clone(),
            format!("repository {}", entry.repository),
            entry.installed_size,
        )
    };

    if json {
        let value = serde_json::json!({
            "info": info,
            "source": source,
            "installed_size": installed_size,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Name:           {}", info.name);
    println!("Version:        {}", info.full_version());
    println!("Description:    {}", info.description);
    if !info.url.is_empty() {
        println!("URL:            {}", info.url);
    }
    if !info.license.is_empty() {
        println!("License:        {}", info.license);
    }
    println!("Architecture:   {}", info.arch);
    println!("Type:           {}", info.package_type);
    println!("Source:         {}", source);
    println!("Installed size: {}", format_size(installed_size));
    for (label, values) in [
        ("Depends", &info.depends),
        ("Make depends", &info.make_depends),
        ("Optional", &info.optional_depends),
        ("Conflicts", &info.conflicts),
        ("Replaces", &info.replaces),
        ("Provides", &info.provides),
    ] {
        if !values.is_empty() {
            println!("{:<15} {}", format!("{}:", label), values.join(", "));
        }
    }
    Ok(())
}

fn cmd_list(root: &Path, reason: Option<&str>, json: bool) -> Result<()> {
    let db = bpm::db::open(root)?;
    let filter = reason
        .map(|r| r.parse::<InstallationReason>())
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;

    let mut rows = Vec::new();
    for info in db.installed_infos()? {
        let reason = db.installation_reason(&info.name)?;
        if filter.is_some_and(|wanted| wanted != reason) {
            continue;
        }
        rows.push((info, reason));
    }

    if json {
        let value: Vec<_> = rows
            .iter()
            .map(|(info, reason)| {
                serde_json::json!({
                    "name": info.name,
                    "version": info.full_version(),
                    "reason": reason,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }
    for (info, reason) in &rows {
        println!("{} {} ({})", info.name, info.full_version(), reason);
    }
    println!("\nTotal: {} package(s)", rows.len());
    Ok(())
}

fn cmd_owner(root: &Path, path: &str) -> Result<()> {
    let db = bpm::db::open(root)?;
    let relative = Path::new(path)
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| path.to_string());
    let relative = relative.trim_matches('/');

    let owners = db.file_owners(&[])?;
    match owners.get(relative) {
        Some(packages) => {
            println!("/{} is owned by {}", relative, packages.join(", "));
            Ok(())
        }
        None => anyhow::bail!("No installed package owns /{}", relative),
    }
}
