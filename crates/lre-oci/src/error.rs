//! Error types for lre-oci

use std::path::PathBuf;

use lre_core::{Digest, ProvisionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OciError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {what}: {source}")]
    Json {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid image layout at {path}: {reason}")]
    InvalidLayout { path: PathBuf, reason: String },

    #[error("tag '{tag}' not found in layout {layout}")]
    TagNotFound { layout: PathBuf, tag: String },

    #[error("blob {0} missing from layout")]
    BlobMissing(Digest),

    /// The local manifest does not hash to the digest the image was pinned by.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("unsupported media type {0}")]
    UnsupportedMediaType(String),

    #[error("layer source {0} does not exist")]
    MissingSource(PathBuf),
}

impl OciError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> OciError {
        let path = path.into();
        move |source| OciError::Io { path, source }
    }

    pub(crate) fn json(what: impl Into<String>) -> impl FnOnce(serde_json::Error) -> OciError {
        let what = what.into();
        move |source| OciError::Json { what, source }
    }
}

impl From<OciError> for ProvisionError {
    fn from(err: OciError) -> Self {
        ProvisionError::Image(err.to_string())
    }
}
