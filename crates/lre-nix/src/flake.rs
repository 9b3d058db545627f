//! Flake identity
//!
//! Every build is driven by the flake at the source root. Its identity is
//! recorded on each artifact so a run can say exactly which pinned inputs
//! produced it.

use std::collections::BTreeMap;
use std::path::Path;

use lre_core::Digest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use tracing::{info, warn};

use crate::error::BuildError;
use crate::Result;

/// What an identity was computed from, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Canonicalised `flake.lock`
    Lock,
    /// `flake.nix` of a flake that has never been locked
    Unlocked,
    /// Sorted source tree, when there is no flake at all
    Tree,
}

/// Content identity of the flake driving a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlakeIdentity {
    pub digest: Digest,
    pub source: IdentitySource,
    /// Locked revision (or NAR hash) of each direct input of the root node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pins: BTreeMap<String, String>,
}

impl FlakeIdentity {
    pub fn short(&self) -> String {
        self.digest.short()
    }
}

/// Identify the flake at `source_root`.
pub fn flake_identity(source_root: &Path) -> Result<FlakeIdentity> {
    let lock = source_root.join("flake.lock");
    let flake = source_root.join("flake.nix");

    let identity = if lock.is_file() {
        identify_lock(&std::fs::read(&lock)?)?
    } else if flake.is_file() {
        warn!(flake = %flake.display(), "flake has no lock file; identity covers flake.nix only");
        FlakeIdentity {
            digest: Digest::compute(&std::fs::read(&flake)?),
            source: IdentitySource::Unlocked,
            pins: BTreeMap::new(),
        }
    } else {
        warn!(root = %source_root.display(), "no flake.nix; identity covers the source tree");
        let mut hasher = Sha256::new();
        feed_tree(source_root, &mut hasher)?;
        FlakeIdentity {
            digest: Digest::from_hasher(hasher),
            source: IdentitySource::Tree,
            pins: BTreeMap::new(),
        }
    };

    info!(
        root = %source_root.display(),
        flake = %identity.short(),
        source = ?identity.source,
        pins = identity.pins.len(),
        "flake identity"
    );
    Ok(identity)
}

/// Hash the lock's canonical JSON, so whitespace and key order don't matter.
fn identify_lock(bytes: &[u8]) -> Result<FlakeIdentity> {
    let lock: Value =
        serde_json::from_slice(bytes).map_err(|e| BuildError::InvalidFlakeLock(e.to_string()))?;
    let root = lock
        .get("root")
        .and_then(Value::as_str)
        .ok_or_else(|| BuildError::InvalidFlakeLock("missing `root`".to_string()))?;
    let nodes = lock
        .get("nodes")
        .and_then(Value::as_object)
        .ok_or_else(|| BuildError::InvalidFlakeLock("missing `nodes`".to_string()))?;

    let mut pins = BTreeMap::new();
    let inputs = nodes
        .get(root)
        .and_then(|n| n.get("inputs"))
        .and_then(Value::as_object);
    for (input, target) in inputs.into_iter().flatten() {
        // Array targets are `follows` paths and carry no lock of their own.
        let Some(node) = target.as_str().and_then(|name| nodes.get(name)) else {
            continue;
        };
        let locked = node.get("locked");
        let pin = locked
            .and_then(|l| l.get("rev"))
            .or_else(|| locked.and_then(|l| l.get("narHash")))
            .and_then(Value::as_str);
        if let Some(pin) = pin {
            pins.insert(input.clone(), pin.to_string());
        }
    }

    Ok(FlakeIdentity {
        digest: Digest::compute(&serde_json::to_vec(&lock)?),
        source: IdentitySource::Lock,
        pins,
    })
}

/// Feed names and contents under `dir` in sorted order, skipping dotfiles,
/// `target/` and `result*` links.
fn feed_tree(dir: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut paths = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();

    for path in paths {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        if name.starts_with('.') || name == "target" || name.starts_with("result") {
            continue;
        }
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        if path.is_dir() {
            feed_tree(&path, hasher)?;
        } else if path.is_file() {
            hasher.update(std::fs::read(&path)?);
            hasher.update([0u8]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LOCK: &str = r#"{
  "nodes": {
    "crane": { "locked": { "narHash": "sha256-crane", "type": "github" } },
    "nixpkgs": { "locked": { "rev": "2b4e5a1", "type": "github" } },
    "root": { "inputs": { "crane": "crane", "nixpkgs": "nixpkgs", "rust": ["crane", "rust"] } }
  },
  "root": "root",
  "version": 7
}"#;

    #[test]
    fn test_lock_identity_ignores_formatting() {
        let pretty = identify_lock(LOCK.as_bytes()).unwrap();
        let value: Value = serde_json::from_str(LOCK).unwrap();
        let compact = identify_lock(value.to_string().as_bytes()).unwrap();
        assert_eq!(pretty, compact);
        assert_eq!(pretty.source, IdentitySource::Lock);
    }

    #[test]
    fn test_root_inputs_are_pinned() {
        let identity = identify_lock(LOCK.as_bytes()).unwrap();
        assert_eq!(identity.pins["nixpkgs"], "2b4e5a1");
        assert_eq!(identity.pins["crane"], "sha256-crane");
        assert!(!identity.pins.contains_key("rust"));
    }

    #[test]
    fn test_bumped_input_changes_identity() {
        let before = identify_lock(LOCK.as_bytes()).unwrap();
        let after = identify_lock(LOCK.replace("2b4e5a1", "9c0d7f3").as_bytes()).unwrap();
        assert_ne!(before.digest, after.digest);
        assert_eq!(after.pins["nixpkgs"], "9c0d7f3");
    }

    #[test]
    fn test_invalid_lock_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("flake.lock"), "not json").unwrap();
        assert!(matches!(
            flake_identity(dir.path()),
            Err(BuildError::InvalidFlakeLock(_))
        ));
        assert!(matches!(
            identify_lock(br#"{"version": 7}"#),
            Err(BuildError::InvalidFlakeLock(_))
        ));
    }

    #[test]
    fn test_strongest_source_wins() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        assert_eq!(
            flake_identity(dir.path()).unwrap().source,
            IdentitySource::Tree
        );

        std::fs::write(dir.path().join("flake.nix"), "{ }").unwrap();
        assert_eq!(
            flake_identity(dir.path()).unwrap().source,
            IdentitySource::Unlocked
        );

        std::fs::write(dir.path().join("flake.lock"), LOCK).unwrap();
        assert_eq!(
            flake_identity(dir.path()).unwrap().source,
            IdentitySource::Lock
        );
    }

    #[test]
    fn test_tree_identity_skips_build_outputs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        let before = flake_identity(dir.path()).unwrap();

        std::fs::create_dir_all(dir.path().join("target/release")).unwrap();
        std::fs::write(dir.path().join("target/release/rbe-server"), "elf").unwrap();
        std::fs::write(dir.path().join("result"), "link").unwrap();
        std::fs::write(dir.path().join(".envrc"), "use flake").unwrap();
        assert_eq!(flake_identity(dir.path()).unwrap(), before);

        std::fs::write(dir.path().join("lib.rs"), "").unwrap();
        assert_ne!(flake_identity(dir.path()).unwrap(), before);
    }
}
