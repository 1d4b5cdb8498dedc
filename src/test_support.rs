// src/test_support.rs

//! Fixture archives and catalogs shared by unit tests

use crate::packages::LifecycleScript;
use crate::repository::{Catalog, Repository, RepositoryDescriptor};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

enum Fixture {
    Dir(String),
    File(String, Vec<u8>, u32),
    Symlink(String, String),
    HardLink(String, String),
}

/// Builds `.bpm` archives with a payload and a matching manifest
pub struct PackageBuilder {
    name: String,
    version: String,
    revision: u32,
    extra: String,
    package_type: &'static str,
    fixtures: Vec<Fixture>,
    scripts: Vec<(LifecycleScript, String)>,
}

impl PackageBuilder {
    pub fn new(name: &str, version: &str, revision: u32) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            revision,
            extra: String::new(),
            package_type: "binary",
            fixtures: Vec::new(),
            scripts: Vec::new(),
        }
    }

    /// Append raw YAML lines to `pkg.info`
    pub fn info(mut self, yaml: &str) -> Self {
        self.extra.push_str(yaml);
        if !yaml.ends_with('\n') {
            self.extra.push('\n');
        }
        self
    }

    pub fn source(mut self) -> Self {
        self.package_type = "source";
        self
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.fixtures.push(Fixture::Dir(path.to_string()));
        self
    }

    pub fn file(self, path: &str, content: &str) -> Self {
        self.file_mode(path, content, 0o644)
    }

    pub fn file_mode(mut self, path: &str, content: &str, mode: u32) -> Self {
        self.fixtures
            .push(Fixture::File(path.to_string(), content.as_bytes().to_vec(), mode));
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.fixtures
            .push(Fixture::Symlink(path.to_string(), target.to_string()));
        self
    }

    pub fn hard_link(mut self, path: &str, target: &str) -> Self {
        self.fixtures
            .push(Fixture::HardLink(path.to_string(), target.to_string()));
        self
    }

    pub fn script(mut self, script: LifecycleScript, content: &str) -> Self {
        self.scripts.push((script, content.to_string()));
        self
    }

    /// `pkg.info` contents
    pub fn info_yaml(&self) -> String {
        format!(
            "name: {}\ndescription: {} fixture\nversion: \"{}\"\nrevision: {}\narch: any\ntype: {}\n{}",
            self.name, self.name, self.version, self.revision, self.package_type, self.extra
        )
    }

    fn manifest(&self) -> String {
        let mut lines = Vec::new();
        for fixture in &self.fixtures {
            match fixture {
                Fixture::Dir(path) => lines.push(format!("{}/ 755 0 0 0", path)),
                Fixture::File(path, content, mode) => {
                    lines.push(format!("{} {:o} 0 0 {}", path, mode, content.len()))
                }
                Fixture::Symlink(path, _) => lines.push(format!("{} 777 0 0 0", path)),
                Fixture::HardLink(path, target) => {
                    let size = self
                        .fixtures
                        .iter()
                        .find_map(|f| match f {
                            Fixture::File(p, content, _) if p == target => Some(content.len()),
                            _ => None,
                        })
                        .unwrap_or(0);
                    lines.push(format!("{} 644 0 0 {}", path, size));
                }
            }
        }
        lines.join("\n") + "\n"
    }

    fn payload(&self) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for fixture in &self.fixtures {
            let mut header = tar::Header::new_gnu();
            match fixture {
                Fixture::Dir(path) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    builder
                        .append_data(&mut header, format!("{}/", path), io::empty())
                        .unwrap();
                }
                Fixture::File(path, content, mode) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(content.len() as u64);
                    builder
                        .append_data(&mut header, path, content.as_slice())
                        .unwrap();
                }
                Fixture::Symlink(path, target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    header.set_link_name(target).unwrap();
                    builder.append_data(&mut header, path, io::empty()).unwrap();
                }
                Fixture::HardLink(path, target) => {
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_mode(0o644);
                    header.set_size(0);
                    header.set_link_name(target).unwrap();
                    builder.append_data(&mut header, path, io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}-{}-any.bpm", self.name, self.version, self.revision)
    }

    /// Write the archive into `dir` and return its path
    pub fn build(&self, dir: &Path) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(self.file_name());
        let mut builder = tar::Builder::new(File::create(&path).unwrap());

        let mut members: Vec<(String, Vec<u8>)> = vec![
            ("pkg.info".to_string(), self.info_yaml().into_bytes()),
            ("pkg.files".to_string(), self.manifest().into_bytes()),
        ];
        for (script, content) in &self.scripts {
            members.push((script.file_name().to_string(), content.clone().into_bytes()));
        }
        if self.package_type == "binary" {
            members.push(("files.tar.gz".to_string(), self.payload()));
        }

        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, name, data.as_slice())
                .unwrap();
        }
        builder.finish().unwrap();
        path
    }
}

/// A single-repository catalog whose archives live in `repo_dir`
///
/// Every package is built into `repo_dir` and advertised under its real
/// archive size and manifest size.
pub fn local_catalog(repo_dir: &Path, packages: &[PackageBuilder]) -> Catalog {
    let mut yaml = String::from("version: \"1\"\nentries:\n");
    for package in packages {
        let archive = package.build(repo_dir);
        let download_size = fs::metadata(&archive).unwrap().len();
        let installed_size = crate::packages::BpmPackage::read_archive(&archive)
            .unwrap()
            .installed_size();

        yaml.push_str(&format!("  {}:\n    info:\n", package.name));
        for line in package.info_yaml().lines() {
            yaml.push_str(&format!("      {}\n", line));
        }
        yaml.push_str(&format!(
            "    download: {}\n    download_size: {}\n    installed_size: {}\n",
            package.file_name(),
            download_size,
            installed_size
        ));
    }

    let descriptor = RepositoryDescriptor::parse(&yaml).unwrap();
    let source = repo_dir.to_string_lossy().to_string();
    Catalog::new(vec![
        Repository::from_descriptor("local", &source, descriptor).unwrap(),
    ])
}
