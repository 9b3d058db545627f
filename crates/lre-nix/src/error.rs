//! Error types for lre-nix

use lre_core::{CommandError, ProvisionError};
use thiserror::Error;

/// Errors raised while building through Nix.
///
/// Every variant is fatal; no partial artifact is ever returned.
#[derive(Error, Debug)]
pub enum BuildError {
    /// `nix build` exited non-zero
    #[error("nix build of .#{attr} failed with code {code}: {stderr}")]
    NixBuildFailed {
        attr: String,
        code: i32,
        stderr: String,
    },

    /// `nix build` succeeded but printed no store path
    #[error("nix build of .#{0} printed no output path")]
    NoOutPath(String),

    /// The realised output does not contain the expected binary
    #[error("output {out_path} has no bin/{binary}")]
    MissingBinary { out_path: String, binary: String },

    /// `nix path-info --recursive` exited non-zero
    #[error("runtime closure of {store_path} failed with code {code}: {stderr}")]
    ClosureQueryFailed {
        store_path: String,
        code: i32,
        stderr: String,
    },

    /// Invalid flake.lock format
    #[error("invalid flake.lock format: {0}")]
    InvalidFlakeLock(String),

    /// The nix process could not be run at all
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<BuildError> for ProvisionError {
    fn from(err: BuildError) -> Self {
        ProvisionError::Build(err.to_string())
    }
}
