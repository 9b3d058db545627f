//! Content-derived image tags.
//!
//! The autogen, deploy and worker images of a flavor all share one tag,
//! derived from the toolchain definition, the realised toolchain tree, the
//! introspection extras tree (when the flavor has one) and the main
//! executable's digest. The tag is a pure function of those inputs:
//! identical inputs give the identical tag across runs and hosts.

use std::path::Path;

use serde::Serialize;
use sha2::{Digest as Sha2Digest, Sha256};

use crate::config::ToolchainDefinition;
use crate::digest::Digest;
use crate::error::Result;
use crate::image::ImageTag;

/// Number of hex characters kept in a derived tag.
pub const TAG_HEX_LEN: usize = 32;

/// Recursively sort object keys so serialization order never affects the hash.
fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&sort_keys(&value))?)
}

/// A realised tree, identified by both its store path and its contents.
#[derive(Serialize)]
struct TreeInput {
    path: String,
    digest: String,
}

impl TreeInput {
    fn of(root: &Path) -> Result<Self> {
        Ok(Self {
            path: root.to_string_lossy().into_owned(),
            digest: Digest::of_tree(root)?.to_string(),
        })
    }
}

#[derive(Serialize)]
struct TagInputs<'a> {
    toolchain: &'a ToolchainDefinition,
    toolchain_root: TreeInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    autogen_extras: Option<TreeInput>,
    executable: String,
}

/// Derives content tags.
pub struct ContentTag;

impl ContentTag {
    /// Tag for the images built from a realised toolchain. `extras_root` is
    /// the tree layered onto the introspection image only.
    pub fn derive(
        definition: &ToolchainDefinition,
        toolchain_root: &Path,
        extras_root: Option<&Path>,
        executable: &Digest,
    ) -> Result<ImageTag> {
        let inputs = TagInputs {
            toolchain: definition,
            toolchain_root: TreeInput::of(toolchain_root)?,
            autogen_extras: extras_root.map(TreeInput::of).transpose()?,
            executable: executable.to_string(),
        };
        let canonical = canonical_json(&inputs)?;
        let hash = hex::encode(Sha256::digest(canonical.as_bytes()));
        ImageTag::new(&hash[..TAG_HEX_LEN])
    }

    /// Tag for an image layered onto a pinned base rather than a realised toolchain.
    pub fn derive_from_base(base: &Digest, executable: &Digest) -> Result<ImageTag> {
        let canonical = canonical_json(&serde_json::json!({
            "base": base.to_string(),
            "executable": executable.to_string(),
        }))?;
        let hash = hex::encode(Sha256::digest(canonical.as_bytes()));
        ImageTag::new(&hash[..TAG_HEX_LEN])
    }
}
