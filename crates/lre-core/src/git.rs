//! Git queries for locating the source root and stamping image revisions.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{ProvisionError, Result};

fn rev_parse(dir: &Path, arg: &str) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", arg])
        .current_dir(dir)
        .output()
        .map_err(|e| ProvisionError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProvisionError::Git(format!(
            "git rev-parse {arg} failed: {}",
            stderr.trim()
        )));
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        return Err(ProvisionError::Git(format!(
            "git rev-parse {arg} returned empty output"
        )));
    }
    Ok(value)
}

/// Top-level directory of the work tree containing `dir`.
pub fn source_root(dir: &Path) -> Result<PathBuf> {
    rev_parse(dir, "--show-toplevel").map(PathBuf::from)
}

/// HEAD commit SHA of the repository containing `repo_dir`.
pub fn capture_head_sha(repo_dir: &Path) -> Result<String> {
    rev_parse(repo_dir, "HEAD")
}
