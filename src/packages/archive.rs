// src/packages/archive.rs

//! BPM package archives
//!
//! An archive is an uncompressed tar holding `pkg.info`, `pkg.files`, the
//! optional lifecycle scripts and, for binary packages, `files.tar.gz` with
//! the file tree rooted at the install prefix.

use crate::error::{Error, Result};
use crate::packages::info::{PackageInfo, PackageType};
use crate::packages::manifest::{self, PackageFileEntry};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::Archive;
use tracing::debug;

/// Metadata member name
pub const INFO_MEMBER: &str = "pkg.info";
/// Manifest member name
pub const FILES_MEMBER: &str = "pkg.files";
/// Compressed payload member name
pub const PAYLOAD_MEMBER: &str = "files.tar.gz";

/// A package's metadata paired with its file manifest
///
/// Represents either an installed package or the contents of an archive
/// that has not been opened for extraction yet.
#[derive(Debug, Clone, PartialEq)]
pub struct BpmPackage {
    pub info: PackageInfo,
    pub files: Vec<PackageFileEntry>,
}

/// Scripts a package may run around its installation or removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleScript {
    PreInstall,
    PostInstall,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
}

impl LifecycleScript {
    pub fn file_name(&self) -> &'static str {
        match self {
            LifecycleScript::PreInstall => "pre_install.sh",
            LifecycleScript::PostInstall => "post_install.sh",
            LifecycleScript::PreUpdate => "pre_update.sh",
            LifecycleScript::PostUpdate => "post_update.sh",
            LifecycleScript::PreRemove => "pre_remove.sh",
            LifecycleScript::PostRemove => "post_remove.sh",
        }
    }
}

impl BpmPackage {
    pub fn new(info: PackageInfo, files: Vec<PackageFileEntry>) -> Self {
        Self { info, files }
    }

    /// Read metadata and manifest from an archive on disk
    pub fn read_archive(path: &Path) -> Result<Self> {
        debug!("Reading package archive: {}", path.display());

        let info_bytes = read_member(path, INFO_MEMBER)?.ok_or_else(|| {
            Error::FormatError(format!("No {} found in {}", INFO_MEMBER, path.display()))
        })?;
        let info_text = String::from_utf8(info_bytes)
            .map_err(|e| Error::FormatError(format!("{} is not valid UTF-8: {}", INFO_MEMBER, e)))?;
        let info = PackageInfo::parse(&info_text)?;

        let files = match read_member(path, FILES_MEMBER)? {
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|e| {
                    Error::FormatError(format!("{} is not valid UTF-8: {}", FILES_MEMBER, e))
                })?;
                manifest::parse_manifest(&text, false)?
            }
            // Source archives carry build instructions instead of a file tree
            None if info.package_type == PackageType::Source => Vec::new(),
            None => {
                return Err(Error::FormatError(format!(
                    "No {} found in {}",
                    FILES_MEMBER,
                    path.display()
                )));
            }
        };

        debug!(
            "Parsed package archive: {} version {} ({} files)",
            info.name,
            info.full_version(),
            files.len()
        );

        Ok(Self { info, files })
    }

    /// Sum of the manifest's file sizes
    pub fn installed_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Open the outer (uncompressed) tar of a package archive
pub fn open_archive(path: &Path) -> Result<Archive<File>> {
    let file = File::open(path).map_err(|e| {
        Error::IoError(format!("Failed to open package archive {}: {}", path.display(), e))
    })?;
    Ok(Archive::new(file))
}

/// Normalized member name of a tar entry
pub fn member_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry
        .path()
        .map_err(|e| Error::FormatError(format!("Failed to get entry path: {}", e)))?;
    let name = path.to_string_lossy();
    Ok(name.trim_start_matches("./").trim_start_matches('/').to_string())
}

/// Read one member of the outer tar into memory
pub fn read_member(path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = open_archive(path)?;

    for entry in archive
        .entries()
        .map_err(|e| Error::FormatError(format!("Failed to read archive entries: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| Error::FormatError(format!("Failed to read archive entry: {}", e)))?;

        if member_name(&entry)? == name {
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| Error::FormatError(format!("Failed to read {}: {}", name, e)))?;
            return Ok(Some(content));
        }
    }

    Ok(None)
}

/// Read a lifecycle script from an archive, if the package ships one
pub fn read_script(path: &Path, script: LifecycleScript) -> Result<Option<Vec<u8>>> {
    read_member(path, script.file_name())
}

/// Run `f` over the decompressed payload tree of a binary archive
pub fn with_payload<R, F>(path: &Path, f: F) -> Result<R>
where
    F: FnOnce(&mut Archive<GzDecoder<&mut dyn Read>>) -> Result<R>,
{
    let mut archive = open_archive(path)?;

    for entry in archive
        .entries()
        .map_err(|e| Error::FormatError(format!("Failed to read archive entries: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| Error::FormatError(format!("Failed to read archive entry: {}", e)))?;

        if member_name(&entry)? == PAYLOAD_MEMBER {
            let reader: &mut dyn Read = &mut entry;
            let mut payload = Archive::new(GzDecoder::new(reader));
            return f(&mut payload);
        }
    }

    Err(Error::FormatError(format!(
        "No {} found in {}",
        PAYLOAD_MEMBER,
        path.display()
    )))
}
