//! LRE-OCI: deterministic OCI image layouts
//!
//! Builds toolchain, introspection and worker images as OCI image layouts on
//! disk. Layers are reproducible tar+gzip archives, so rebuilding an
//! unchanged tree yields the same blob, config and manifest digests.

pub mod builder;
pub mod error;
pub mod layer;
pub mod layout;
pub mod schema;
pub mod store;

pub use builder::{BuildRequest, BuiltImage, OciImageBuilder};
pub use error::OciError;
pub use layer::{build_layer, LayerSource};
pub use layout::{dir_manifest_digest, BaseImage, BaseSource, OciLayout};
pub use store::BlobStore;

/// Result type for lre-oci operations
pub type Result<T> = std::result::Result<T, OciError>;
