// src/packages/manifest.rs

//! File manifests (`pkg.files` inside archives, `files` in the registry)
//!
//! One line per path: `<path> <octal-perms> <uid> <gid> <size-bytes>`.
//! Directories carry a trailing `/`. Paths may contain spaces, so the four
//! numeric fields are split off from the right.

use crate::error::{Error, Result};
use std::fmt;

/// One manifest line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFileEntry {
    /// Relative path without leading or trailing slash
    pub path: String,
    pub is_dir: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl PackageFileEntry {
    /// Create a regular file entry
    pub fn file(path: &str, mode: u32, size: u64) -> Self {
        Self {
            path: path.trim_matches('/').to_string(),
            is_dir: false,
            mode,
            uid: 0,
            gid: 0,
            size,
        }
    }

    /// Create a directory entry
    pub fn directory(path: &str, mode: u32) -> Self {
        Self {
            path: path.trim_matches('/').to_string(),
            is_dir: true,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
        }
    }

    /// Parse one manifest line
    ///
    /// With `legacy` set, a line without the numeric fields is accepted with
    /// zeroed metadata instead of being rejected.
    pub fn parse_line(line: &str, legacy: bool) -> Result<Self> {
        let fields: Vec<&str> = line.rsplitn(5, ' ').collect();

        if fields.len() == 5 {
            let numbers = (
                u32::from_str_radix(fields[3], 8),
                fields[2].parse::<u32>(),
                fields[1].parse::<u32>(),
                fields[0].parse::<u64>(),
            );

            if let (Ok(mode), Ok(uid), Ok(gid), Ok(size)) = numbers {
                let raw_path = fields[4];
                return Ok(Self {
                    path: raw_path.trim_matches('/').to_string(),
                    is_dir: raw_path.ends_with('/'),
                    mode,
                    uid,
                    gid,
                    size,
                });
            }
        }

        if legacy {
            return Ok(Self {
                path: line.trim_matches('/').to_string(),
                is_dir: line.ends_with('/'),
                mode: 0,
                uid: 0,
                gid: 0,
                size: 0,
            });
        }

        Err(Error::FormatError(format!("Malformed manifest line: '{}'", line)))
    }

    /// The path as it appears in a manifest, with the directory suffix
    pub fn manifest_path(&self) -> String {
        if self.is_dir {
            format!("{}/", self.path)
        } else {
            self.path.clone()
        }
    }
}

impl fmt::Display for PackageFileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:o} {} {} {}",
            self.manifest_path(),
            self.mode,
            self.uid,
            self.gid,
            self.size
        )
    }
}

/// Parse a whole manifest, skipping blank lines
pub fn parse_manifest(content: &str, legacy: bool) -> Result<Vec<PackageFileEntry>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| PackageFileEntry::parse_line(line, legacy))
        .collect()
}

/// Render a manifest back to text
pub fn format_manifest(entries: &[PackageFileEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_string());
        out.push('\n');
    }
    out
}
