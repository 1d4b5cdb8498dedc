// src/filesystem/mod.rs

//! File-level install and removal under a target root
//!
//! Removal works from a package manifest and never deletes a path another
//! installed package still owns. Installation extracts the payload tree of a
//! binary archive, honouring the package's keep list.

use crate::error::{Error, Result};
use crate::packages::archive::{member_name, with_payload};
use crate::packages::manifest::PackageFileEntry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tracing::{debug, info, warn};

/// Path owners, as returned by [`crate::db::Database::file_owners`]
pub type FileOwners = BTreeMap<String, Vec<String>>;

/// Resolve a package-relative path under `root`
///
/// Leading slashes are stripped and `.` components dropped; `..` is rejected
/// so nothing can escape the root.
pub fn safe_target_path(root: &Path, path: &str) -> Result<PathBuf> {
    let relative_path = path.trim_start_matches('/');

    let mut normalized = PathBuf::new();
    for component in Path::new(relative_path).components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                warn!("Path traversal attempt detected: {}", path);
                return Err(Error::FormatError(format!("Path traversal detected: {}", path)));
            }
            Component::Prefix(_) | Component::RootDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::FormatError(format!("Empty path in package: '{}'", path)));
    }

    Ok(root.join(normalized))
}

/// Fail when an existing ancestor of `target` resolves outside `root`
///
/// `root` must already be canonical. Symlinked directories, including ones
/// created earlier from the same payload, may point anywhere inside the root
/// but never out of it. Dangling symlinks on the way are refused.
fn ensure_within_root(root: &Path, target: &Path) -> Result<()> {
    let mut ancestor = target.parent();
    while let Some(dir) = ancestor {
        match fs::canonicalize(dir) {
            Ok(resolved) if resolved.starts_with(root) => return Ok(()),
            Ok(resolved) => {
                warn!("{} resolves to {}, outside the root", dir.display(), resolved.display());
                return Err(Error::FormatError(format!(
                    "{} escapes the root through {}",
                    target.display(),
                    dir.display()
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if fs::symlink_metadata(dir).is_ok() {
                    return Err(Error::FormatError(format!(
                        "{} passes through dangling link {}",
                        target.display(),
                        dir.display()
                    )));
                }
                ancestor = dir.parent();
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Whether `path` is covered by a keep list
///
/// Entries ending in `/` keep the whole subtree below them.
pub fn is_kept(path: &str, keep: &[String]) -> bool {
    let path = path.trim_matches('/');
    keep.iter().any(|entry| {
        let entry = entry.trim_start_matches('/');
        match entry.strip_suffix('/') {
            Some(dir) => {
                let dir = dir.trim_end_matches('/');
                path == dir || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
            }
            None => path == entry,
        }
    })
}

/// Remove the files of a manifest from `root`
///
/// Paths are processed in reverse lexical order so directories are emptied
/// before they are visited. Paths listed in `owners` (other packages' files)
/// and paths covered by `keep` are left alone, as are non-empty directories.
/// Missing paths are ignored.
pub fn remove_files(
    root: &Path,
    files: &[PackageFileEntry],
    owners: &FileOwners,
    keep: &[String],
) -> Result<()> {
    let mut entries: Vec<&PackageFileEntry> = files.iter().filter(|f| !f.path.is_empty()).collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    for entry in entries.into_iter().rev() {
        if let Some(other) = owners.get(&entry.path).filter(|o| !o.is_empty()) {
            debug!("Keeping {}: still owned by {}", entry.path, other.join(", "));
            continue;
        }
        if is_kept(&entry.path, keep) {
            debug!("Keeping {}: listed in keep", entry.path);
            continue;
        }

        let target = safe_target_path(root, &entry.path)?;
        let metadata = match fs::symlink_metadata(&target) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Already removed: {}", entry.path);
                continue;
            }
            Err(e) => {
                return Err(Error::IoError(format!(
                    "Failed to inspect {}: {}",
                    target.display(),
                    e
                )));
            }
        };

        // symlink_metadata never reports a symlink as a directory
        if metadata.is_dir() {
            if fs::read_dir(&target)?.next().is_some() {
                debug!("Directory not empty, skipping: {}", entry.path);
                continue;
            }
            fs::remove_dir(&target).map_err(|e| {
                Error::IoError(format!("Failed to remove directory {}: {}", target.display(), e))
            })?;
        } else {
            fs::remove_file(&target).map_err(|e| {
                Error::IoError(format!("Failed to remove {}: {}", target.display(), e))
            })?;
        }
        debug!("Removed {}", entry.path);
    }

    Ok(())
}

/// Extract the payload of a binary archive into `root`
///
/// Permissions and ownership come from `manifest` when it lists the path.
/// Existing paths covered by `keep` are not touched. Hard links are created
/// once every regular file is in place. No entry is written through a
/// symlink that leads out of `root`.
pub fn extract_files(
    archive: &Path,
    root: &Path,
    manifest: &[PackageFileEntry],
    keep: &[String],
) -> Result<usize> {
    let declared: HashMap<&str, &PackageFileEntry> =
        manifest.iter().map(|f| (f.path.as_str(), f)).collect();
    let canonical_root = fs::canonicalize(root).map_err(|e| {
        Error::IoError(format!("Failed to resolve root {}: {}", root.display(), e))
    })?;

    with_payload(archive, |payload| {
        let mut hard_links: Vec<(PathBuf, String, String)> = Vec::new();
        let mut extracted = 0;

        for entry in payload
            .entries()
            .map_err(|e| Error::FormatError(format!("Failed to read payload: {}", e)))?
        {
            let mut entry =
                entry.map_err(|e| Error::FormatError(format!("Failed to read payload entry: {}", e)))?;

            let name = member_name(&entry)?;
            let relative = name.trim_end_matches('/').to_string();
            if relative.is_empty() || relative == "." {
                continue;
            }

            let target = safe_target_path(root, &relative)?;
            if is_kept(&relative, keep) && fs::symlink_metadata(&target).is_ok() {
                info!("Keeping existing {}", relative);
                continue;
            }

            let declared_entry = declared.get(relative.as_str()).copied();
            let mode = declared_entry
                .map(|file| file.mode)
                .filter(|mode| *mode != 0)
                .unwrap_or_else(|| entry.header().mode().unwrap_or(0o644))
                & 0o7777;

            match entry.header().entry_type() {
                EntryType::Directory => {
                    ensure_within_root(&canonical_root, &target)?;
                    if fs::symlink_metadata(&target).is_ok_and(|m| !m.is_dir()) {
                        fs::remove_file(&target)?;
                    }
                    fs::create_dir_all(&target).map_err(|e| {
                        Error::IoError(format!("Failed to create {}: {}", target.display(), e))
                    })?;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
                    set_owner(&target, declared_entry);
                }
                EntryType::Symlink => {
                    let link = entry
                        .link_name()
                        .map_err(|e| Error::FormatError(format!("Bad link in {}: {}", relative, e)))?
                        .ok_or_else(|| {
                            Error::FormatError(format!("Symlink {} has no target", relative))
                        })?
                        .into_owned();
                    if !prepare_target(&canonical_root, &target, &relative)? {
                        continue;
                    }
                    std::os::unix::fs::symlink(&link, &target).map_err(|e| {
                        Error::IoError(format!("Failed to create symlink {}: {}", target.display(), e))
                    })?;
                    set_owner(&target, declared_entry);
                }
                EntryType::Link => {
                    let link = entry
                        .link_name()
                        .map_err(|e| Error::FormatError(format!("Bad link in {}: {}", relative, e)))?
                        .ok_or_else(|| {
                            Error::FormatError(format!("Hard link {} has no target", relative))
                        })?
                        .to_string_lossy()
                        .trim_start_matches("./")
                        .to_string();
                    hard_links.push((target, relative, link));
                    continue;
                }
                EntryType::Regular | EntryType::Continuous => {
                    if !prepare_target(&canonical_root, &target, &relative)? {
                        continue;
                    }
                    let mut file = File::create(&target).map_err(|e| {
                        Error::IoError(format!("Failed to create {}: {}", target.display(), e))
                    })?;
                    io::copy(&mut entry, &mut file).map_err(|e| match e.kind() {
                        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                            Error::FormatError(format!("Corrupt payload at {}: {}", relative, e))
                        }
                        _ => Error::IoError(format!("Failed to write {}: {}", target.display(), e)),
                    })?;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
                    set_owner(&target, declared_entry);
                }
                other => {
                    warn!("Skipping {}: unsupported entry type {:?}", relative, other);
                    continue;
                }
            }

            extracted += 1;
        }

        for (target, relative, link) in hard_links {
            let source = safe_target_path(root, &link)?;
            ensure_within_root(&canonical_root, &source)?;
            if !prepare_target(&canonical_root, &target, &relative)? {
                continue;
            }
            fs::hard_link(&source, &target).map_err(|e| {
                Error::IoError(format!(
                    "Failed to link {} to {}: {}",
                    target.display(),
                    source.display(),
                    e
                ))
            })?;
            extracted += 1;
        }

        debug!("Extracted {} entries from {}", extracted, archive.display());
        Ok(extracted)
    })
}

/// Clear the way for a non-directory entry at `target`
///
/// Returns `false` when a directory occupies the path, which is never
/// replaced.
fn prepare_target(root: &Path, target: &Path, relative: &str) -> Result<bool> {
    ensure_within_root(root, target)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::symlink_metadata(target) {
        Ok(metadata) if metadata.is_dir() => {
            warn!("Not replacing directory {} with a file", relative);
            Ok(false)
        }
        Ok(_) => {
            fs::remove_file(target)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Best-effort ownership from the manifest; unprivileged runs keep their own
fn set_owner(target: &Path, declared: Option<&PackageFileEntry>) {
    if let Some(file) = declared {
        if let Err(e) = std::os::unix::fs::lchown(target, Some(file.uid), Some(file.gid)) {
            debug!("Could not set owner of {}: {}", target.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::BpmPackage;
    use crate::test_support::PackageBuilder;
    use tempfile::TempDir;

    #[test]
    fn test_safe_target_path() {
        let root = Path::new("/target");
        assert_eq!(
            safe_target_path(root, "/usr/bin/hello").unwrap(),
            PathBuf::from("/target/usr/bin/hello")
        );
        assert_eq!(
            safe_target_path(root, "./etc/./hello.conf").unwrap(),
            PathBuf::from("/target/etc/hello.conf")
        );
        assert!(safe_target_path(root, "usr/../../etc/passwd").is_err());
        assert!(safe_target_path(root, "/").is_err());
    }

    #[test]
    fn test_is_kept() {
        let keep = vec!["etc/hello.conf".to_string(), "/var/lib/hello/".to_string()];
        assert!(is_kept("etc/hello.conf", &keep));
        assert!(!is_kept("etc/hello.conf.d", &keep));
        assert!(is_kept("var/lib/hello", &keep));
        assert!(is_kept("var/lib/hello/state/db", &keep));
        assert!(!is_kept("var/lib/hello-other", &keep));
    }

    #[test]
    fn test_extract_and_remove() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let archive = PackageBuilder::new("hello", "1.0", 1)
            .dir("usr")
            .dir("usr/bin")
            .file_mode("usr/bin/hello", "#!/bin/sh\necho hello\n", 0o755)
            .symlink("usr/bin/hi", "hello")
            .hard_link("usr/bin/hallo", "usr/bin/hello")
            .build(&temp.path().join("pkgs"));
        let package = BpmPackage::read_archive(&archive).unwrap();

        let count = extract_files(&archive, &root, &package.files, &[]).unwrap();
        assert_eq!(count, 5);

        let hello = root.join("usr/bin/hello");
        assert_eq!(fs::read_to_string(&hello).unwrap(), "#!/bin/sh\necho hello\n");
        assert_eq!(fs::metadata(&hello).unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(
            fs::read_link(root.join("usr/bin/hi")).unwrap(),
            PathBuf::from("hello")
        );
        assert_eq!(fs::read_to_string(root.join("usr/bin/hallo")).unwrap(), "#!/bin/sh\necho hello\n");

        remove_files(&root, &package.files, &FileOwners::new(), &[]).unwrap();
        assert!(!root.join("usr").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_remove_skips_shared_and_non_empty() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/x"), "x").unwrap();
        fs::write(root.join("usr/bin/mine"), "mine").unwrap();
        fs::write(root.join("usr/bin/foreign"), "untracked").unwrap();

        let files = vec![
            PackageFileEntry::directory("usr", 0o755),
            PackageFileEntry::directory("usr/bin", 0o755),
            PackageFileEntry::file("usr/bin/x", 0o755, 1),
            PackageFileEntry::file("usr/bin/mine", 0o755, 4),
            PackageFileEntry::file("usr/bin/gone", 0o755, 4),
        ];
        let mut owners = FileOwners::new();
        owners.insert("usr/bin/x".to_string(), vec!["q".to_string()]);

        remove_files(root, &files, &owners, &[]).unwrap();
        assert!(root.join("usr/bin/x").exists());
        assert!(!root.join("usr/bin/mine").exists());
        assert!(root.join("usr/bin/foreign").exists());
    }

    #[test]
    fn test_remove_symlink_to_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("opt/real")).unwrap();
        fs::write(root.join("opt/real/data"), "data").unwrap();
        std::os::unix::fs::symlink("real", root.join("opt/link")).unwrap();

        let files = vec![PackageFileEntry::file("opt/link", 0o777, 0)];
        remove_files(root, &files, &FileOwners::new(), &[]).unwrap();

        assert!(fs::symlink_metadata(root.join("opt/link")).is_err());
        assert!(root.join("opt/real/data").exists());
    }

    #[test]
    fn test_keep_list_preserves_existing() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/hello.conf"), "user edited").unwrap();

        let archive = PackageBuilder::new("hello", "1.0", 1)
            .dir("etc")
            .file("etc/hello.conf", "default")
            .file("etc/other.conf", "other")
            .build(&temp.path().join("pkgs"));
        let package = BpmPackage::read_archive(&archive).unwrap();
        let keep = vec!["etc/hello.conf".to_string()];

        extract_files(&archive, &root, &package.files, &keep).unwrap();
        assert_eq!(fs::read_to_string(root.join("etc/hello.conf")).unwrap(), "user edited");
        assert_eq!(fs::read_to_string(root.join("etc/other.conf")).unwrap(), "other");

        remove_files(&root, &package.files, &FileOwners::new(), &keep).unwrap();
        assert!(root.join("etc/hello.conf").exists());
        assert!(!root.join("etc/other.conf").exists());
    }

    #[test]
    fn test_symlinked_parent_cannot_escape_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();

        let archive = PackageBuilder::new("evil", "1.0", 1)
            .symlink("etc", outside.to_str().unwrap())
            .file("etc/pwned", "x")
            .build(&temp.path().join("pkgs"));
        let package = BpmPackage::read_archive(&archive).unwrap();

        let result = extract_files(&archive, &root, &package.files, &[]);
        assert!(matches!(result, Err(Error::FormatError(_))));
        assert!(!outside.join("pwned").exists());
    }

    #[test]
    fn test_symlinked_parent_inside_root_allowed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let archive = PackageBuilder::new("lib", "1.0", 1)
            .dir("usr")
            .dir("usr/lib")
            .symlink("usr/lib64", "lib")
            .file("usr/lib64/libx.so", "elf")
            .build(&temp.path().join("pkgs"));
        let package = BpmPackage::read_archive(&archive).unwrap();

        extract_files(&archive, &root, &package.files, &[]).unwrap();
        assert_eq!(fs::read_to_string(root.join("usr/lib/libx.so")).unwrap(), "elf");
    }

    #[test]
    fn test_existing_outside_symlink_blocks_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("opt")).unwrap();

        let archive = PackageBuilder::new("evil", "1.0", 1)
            .dir("opt/sub")
            .build(&temp.path().join("pkgs"));
        let package = BpmPackage::read_archive(&archive).unwrap();

        let result = extract_files(&archive, &root, &package.files, &[]);
        assert!(matches!(result, Err(Error::FormatError(_))));
        assert!(!outside.join("sub").exists());
    }

    #[test]
    fn test_traversal_rejected_on_extract() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();

        // tar::Builder refuses `..` itself, so write the raw name into the header
        let mut payload = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        let name = b"../escape";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        payload.append(&header, &b"bad"[..]).unwrap();
        let payload = payload.into_inner().unwrap().finish().unwrap();

        let archive = temp.path().join("evil.bpm");
        let mut outer = tar::Builder::new(File::create(&archive).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        outer
            .append_data(&mut header, "files.tar.gz", payload.as_slice())
            .unwrap();
        outer.finish().unwrap();

        let result = extract_files(&archive, &root, &[], &[]);
        assert!(matches!(result, Err(Error::FormatError(_))));
        assert!(!temp.path().join("escape").exists());
    }
}
