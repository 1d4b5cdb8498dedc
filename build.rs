// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .action(ArgAction::SetTrue)
        .help(help)
}

fn dry_run() -> Arg {
    Arg::new("dry-run")
        .short('n')
        .long("dry-run")
        .action(ArgAction::SetTrue)
        .help("Only show what would be done")
}

fn no_scripts() -> Arg {
    flag("no-scripts", "Do not run lifecycle scripts")
}

fn build_cli() -> Command {
    Command::new("bpm")
        .version(env!("CARGO_PKG_VERSION"))
        .author("BPM Contributors")
        .about("Package manager for file-tree rooted systems")
        .subcommand_required(true)
        .arg(
            Arg::new("root")
                .short('R')
                .long("root")
                .global(true)
                .default_value("/")
                .help("Target root directory"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .default_value("/etc/bpm.conf")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Show debug output and per-package details"),
        )
        .subcommand(
            Command::new("info")
                .about("Show metadata of an installed package, catalog entry or archive")
                .arg(Arg::new("package").required(true).help("Package name or archive path"))
                .arg(flag("json", "Print JSON instead of text")),
        )
        .subcommand(
            Command::new("list")
                .about("List installed packages")
                .arg(
                    Arg::new("reason")
                        .long("reason")
                        .value_parser(["manual", "dependency", "unknown"])
                        .help("Only packages installed for this reason"),
                )
                .arg(flag("json", "Print JSON instead of text")),
        )
        .subcommand(
            Command::new("owner")
                .about("Show which installed packages own a path")
                .arg(Arg::new("path").required(true).help("Path inside the root")),
        )
        .subcommand(
            Command::new("install")
                .about("Install packages by name or from local archives")
                .arg(
                    Arg::new("packages")
                        .required(true)
                        .num_args(1..)
                        .help("Package names or archive paths"),
                )
                .arg(flag("reinstall", "Reinstall packages already installed at the same version"))
                .arg(flag("reinstall-all", "Reinstall dependencies as well"))
                .arg(
                    Arg::new("reason")
                        .long("reason")
                        .value_parser(["manual", "dependency", "unknown"])
                        .help("Installation reason recorded for the requested packages"),
                )
                .arg(flag("optional", "Install optional dependencies too"))
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Continue despite missing dependencies, conflicts and foreign architectures"),
                )
                .arg(no_scripts())
                .arg(dry_run()),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove installed packages")
                .arg(Arg::new("packages").required(true).num_args(1..))
                .arg(flag("unused", "Skip packages other installed packages still depend on"))
                .arg(flag("cleanup", "Also remove dependencies nothing needs anymore"))
                .arg(no_scripts())
                .arg(dry_run()),
        )
        .subcommand(
            Command::new("cleanup")
                .about("Remove orphaned dependencies")
                .arg(flag("keep-optional", "Keep optional dependencies of kept packages"))
                .arg(no_scripts())
                .arg(dry_run()),
        )
        .subcommand(
            Command::new("update")
                .about("Update installed packages from the configured repositories")
                .arg(
                    Arg::new("sync")
                        .short('s')
                        .long("sync")
                        .action(ArgAction::SetTrue)
                        .help("Synchronize repositories first"),
                )
                .arg(flag("optional", "Install optional dependencies too"))
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue),
                )
                .arg(no_scripts())
                .arg(dry_run()),
        )
        .subcommand(Command::new("sync").about("Synchronize repository descriptors"))
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(Arg::new("shell").required(true).help("Shell type")),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("bpm.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
