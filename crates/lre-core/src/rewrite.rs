//! Platform-config rewriter.
//!
//! The config generator writes the name of the disposable introspection image
//! into the configs it emits. Before the configs are usable that name must be
//! replaced by the logical deploy name. Substitution is literal and byte-wise,
//! so non-UTF-8 files pass through untouched apart from matches.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::RewriteError;
use crate::flavor::ToolchainFlavor;

type Result<T> = std::result::Result<T, RewriteError>;

/// Summary of one rewrite pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteReport {
    pub root: PathBuf,
    pub from: String,
    pub to: String,
    pub files_scanned: usize,
    /// Files that contained at least one match, relative to `root`.
    pub files_changed: Vec<PathBuf>,
    pub replacements: usize,
}

/// A generated platform config that passed verification.
///
/// Only [`GeneratedPlatformConfig::finalize`] constructs this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedPlatformConfig {
    flavor: ToolchainFlavor,
    root: PathBuf,
    build_file: PathBuf,
    env_file: Option<PathBuf>,
}

impl GeneratedPlatformConfig {
    /// Verify that `root` no longer mentions `stale_name` and contains a
    /// `config/BUILD`, then mark it final.
    pub fn finalize(
        flavor: ToolchainFlavor,
        root: &Path,
        stale_name: &str,
        env_file: &Path,
    ) -> Result<Self> {
        verify(root, stale_name)?;

        let build_file = root.join("config").join("BUILD");
        if !build_file.is_file() {
            return Err(RewriteError::Incomplete {
                root: root.to_path_buf(),
                missing: "config/BUILD".to_string(),
            });
        }
        let env_file = Some(root.join(env_file)).filter(|p| p.is_file());

        Ok(Self {
            flavor,
            root: root.to_path_buf(),
            build_file,
            env_file,
        })
    }

    pub fn flavor(&self) -> ToolchainFlavor {
        self.flavor
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn build_file(&self) -> &Path {
        &self.build_file
    }

    /// Environment-mapping file, when the generator emitted one.
    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }
}

/// Count non-overlapping occurrences of `needle` in `haystack`.
fn count_matches(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    let mut count = 0;
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            count += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    count
}

/// Replace every non-overlapping occurrence of `from` with `to`.
fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(haystack.len());
    let mut count = 0;
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(from) {
            out.extend_from_slice(to);
            count += 1;
            i += from.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    (out, count)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RewriteError + '_ {
    move |source| RewriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Regular files under `root`, sorted.
fn regular_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(RewriteError::MissingOutputDir(root.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            RewriteError::Io {
                path,
                source: e.into(),
            }
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Replace `contents` of `path` atomically, keeping its permissions.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let permissions = fs::metadata(path).map_err(io_err(path))?.permissions();

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err(path))?;
    tmp.write_all(contents).map_err(io_err(path))?;
    tmp.as_file()
        .set_permissions(permissions)
        .map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| RewriteError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Replace `from` with `to` in every regular file under `root`.
///
/// Files without a match are left untouched. Rejects a `to` that contains
/// `from`, since applying such a rewrite twice would keep growing the files.
pub fn rewrite(root: &Path, from: &str, to: &str) -> Result<RewriteReport> {
    if from.is_empty() {
        return Err(RewriteError::EmptyPattern);
    }
    if to.contains(from) {
        return Err(RewriteError::NonConvergent {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let files = regular_files(root)?;
    let mut report = RewriteReport {
        root: root.to_path_buf(),
        from: from.to_string(),
        to: to.to_string(),
        files_scanned: files.len(),
        files_changed: Vec::new(),
        replacements: 0,
    };

    for path in files {
        let contents = fs::read(&path).map_err(io_err(&path))?;
        let (rewritten, count) = replace_bytes(&contents, from.as_bytes(), to.as_bytes());
        if count == 0 {
            continue;
        }
        write_atomic(&path, &rewritten)?;
        debug!(file = %path.display(), count, "rewrote references");
        report.replacements += count;
        report
            .files_changed
            .push(path.strip_prefix(root).unwrap_or(&path).to_path_buf());
    }

    info!(
        root = %root.display(),
        from,
        to,
        files = report.files_changed.len(),
        replacements = report.replacements,
        "rewrite complete"
    );
    Ok(report)
}

/// Fail with [`RewriteError::Residual`] if any file under `root` still mentions `name`.
pub fn verify(root: &Path, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RewriteError::EmptyPattern);
    }
    let mut count = 0;
    let mut offenders = Vec::new();
    for path in regular_files(root)? {
        let contents = fs::read(&path).map_err(io_err(&path))?;
        let n = count_matches(&contents, name.as_bytes());
        if n > 0 {
            count += n;
            offenders.push(path.strip_prefix(root).unwrap_or(&path).to_path_buf());
        }
    }
    if count > 0 {
        return Err(RewriteError::Residual {
            name: name.to_string(),
            count,
            files: offenders,
        });
    }
    Ok(())
}
