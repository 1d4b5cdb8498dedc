// src/operation/scripts.rs

//! Lifecycle script execution
//!
//! Scripts run through `/bin/sh` with the target root as working directory
//! and stdin closed. Package details are exported as `BPM_*` variables.

use crate::error::{Error, Result};
use crate::packages::{LifecycleScript, PackageInfo};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const INTERPRETER: &str = "/bin/sh";

/// Runs the lifecycle scripts of one package against one root
pub struct ScriptRunner {
    root: PathBuf,
    name: String,
    version: String,
    revision: u32,
    url: String,
    arch: String,
}

impl ScriptRunner {
    pub fn new(root: &Path, info: &PackageInfo) -> Self {
        Self {
            root: root.to_path_buf(),
            name: info.name.clone(),
            version: info.version.clone(),
            revision: info.revision,
            url: info.url.clone(),
            arch: info.arch.clone(),
        }
    }

    /// Run `content` as the `script` of this package
    pub fn run(&self, script: LifecycleScript, content: &[u8]) -> Result<()> {
        let phase = script.file_name();
        info!("Running {} of {} {}-{}", phase, self.name, self.version, self.revision);

        let temp_dir = TempDir::new()?;
        let script_path = temp_dir.path().join(phase);
        fs::write(&script_path, content)?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o700))?;

        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let output = Command::new(INTERPRETER)
            .arg(&script_path)
            .current_dir(&root)
            .env("BPM_ROOT", &root)
            .env("BPM_PKG_NAME", &self.name)
            .env("BPM_PKG_VERSION", &self.version)
            .env("BPM_PKG_REVISION", self.revision.to_string())
            .env("BPM_PKG_URL", &self.url)
            .env("BPM_PKG_ARCH", &self.arch)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::ScriptError {
                package: self.name.clone(),
                script: phase.to_string(),
                status: format!("failed to spawn {}: {}", INTERPRETER, e),
            })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!("[{}] {}", phase, line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!("[{}] {}", phase, line);
        }

        if !output.status.success() {
            return Err(Error::ScriptError {
                package: self.name.clone(),
                script: phase.to_string(),
                status: output.status.to_string(),
            });
        }

        debug!("{} of {} completed", phase, self.name);
        Ok(())
    }

    /// Run `script` if `content` holds one
    pub fn run_optional(&self, script: LifecycleScript, content: Option<&[u8]>) -> Result<()> {
        match content {
            Some(content) => self.run(script, content),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> PackageInfo {
        PackageInfo::parse(
            "name: hello\ndescription: test\nversion: \"2.1\"\nrevision: 3\nurl: https://example.com\narch: any\ntype: binary\n",
        )
        .unwrap()
    }

    #[test]
    fn test_script_sees_environment() {
        let temp = tempfile::TempDir::new().unwrap();
        let runner = ScriptRunner::new(temp.path(), &info());

        runner
            .run(
                LifecycleScript::PostInstall,
                b"echo \"$BPM_PKG_NAME $BPM_PKG_VERSION-$BPM_PKG_REVISION $BPM_PKG_ARCH\" > \"$BPM_ROOT/marker\"\n",
            )
            .unwrap();

        let marker = fs::read_to_string(temp.path().join("marker")).unwrap();
        assert_eq!(marker.trim(), "hello 2.1-3 any");
    }

    #[test]
    fn test_failing_script() {
        let temp = tempfile::TempDir::new().unwrap();
        let runner = ScriptRunner::new(temp.path(), &info());

        let result = runner.run(LifecycleScript::PreRemove, b"exit 3\n");
        match result {
            Err(Error::ScriptError { package, script, .. }) => {
                assert_eq!(package, "hello");
                assert_eq!(script, "pre_remove.sh");
            }
            other => panic!("expected a script error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_script_is_skipped() {
        let temp = tempfile::TempDir::new().unwrap();
        let runner = ScriptRunner::new(temp.path(), &info());
        runner.run_optional(LifecycleScript::PreInstall, None).unwrap();
    }
}
