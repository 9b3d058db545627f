//! LRE-Nix: hermetic build graph on Nix flakes
//!
//! Produces the statically linked main executable in two steps (dependency
//! closure, then the full build) and realises per-flavor toolchain package
//! sets into store trees that become image layers.

pub mod error;
pub mod flake;
pub mod graph;
pub mod source;

pub use error::BuildError;
pub use flake::{flake_identity, FlakeIdentity, IdentitySource};
pub use graph::{CachedArtifactSet, Executable, NixBuildGraph, RealizedToolchain};
pub use source::BuildInputs;

/// Result type for lre-nix operations
pub type Result<T> = std::result::Result<T, BuildError>;
