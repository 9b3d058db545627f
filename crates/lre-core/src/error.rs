//! Error taxonomy for LRE provisioning.
//!
//! Every stage of the pipeline maps its failures onto [`ProvisionError`].
//! None of these are retried: the first error ends the run.

use std::path::PathBuf;

/// Errors produced while running an external command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command has no program")]
    Empty,

    #[error("failed to start `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("`{command}` exited with code {code}")]
    NonZeroExit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },
}

/// Errors produced by the platform-config rewriter.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("generated config directory does not exist: {0}")]
    MissingOutputDir(PathBuf),

    #[error("replacement `{to}` contains `{from}`; rewriting would never converge")]
    NonConvergent { from: String, to: String },

    #[error("rewrite pattern must not be empty")]
    EmptyPattern,

    #[error("{count} reference(s) to `{name}` remain in {files:?}")]
    Residual {
        name: String,
        count: usize,
        files: Vec<PathBuf>,
    },

    #[error("generated config at {root} has no {missing}")]
    Incomplete { root: PathBuf, missing: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced while loading or validating pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Umbrella error for provisioning operations.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Compilation or link failure in the hermetic build graph.
    #[error("build failed: {0}")]
    Build(String),

    /// Failed pull, build, load or push of a container image.
    #[error("image error: {0}")]
    Image(String),

    /// The external config generator failed.
    #[error("config generation failed for {flavor}: {reason}")]
    Generation { flavor: String, reason: String },

    #[error("rewrite failed: {0}")]
    Rewrite(#[from] RewriteError),

    /// Static misconfiguration of the deployment topology.
    #[error("topology error: {0}")]
    Topology(String),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("git error: {0}")]
    Git(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
