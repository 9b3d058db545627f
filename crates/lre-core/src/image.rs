//! Image identities: tags, references and content-addressed images.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::ProvisionError;
use crate::flavor::ToolchainFlavor;

/// A validated OCI tag (`[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageTag(String);

impl ImageTag {
    pub fn new(tag: impl Into<String>) -> Result<Self, ProvisionError> {
        let tag = tag.into();
        let mut chars = tag.chars();
        let valid_first = chars
            .next()
            .map(|c| c.is_ascii_alphanumeric() || c == '_')
            .unwrap_or(false);
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid_first || !valid_rest || tag.len() > 128 {
            return Err(ProvisionError::InvalidReference(format!(
                "invalid tag '{tag}'"
            )));
        }
        Ok(Self(tag))
    }

    /// The fixed `latest` tag.
    pub fn latest() -> Self {
        Self("latest".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ImageTag {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ImageTag> for String {
    fn from(value: ImageTag) -> Self {
        value.0
    }
}

/// `name:tag` reference inside a daemon or registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub name: String,
    pub tag: ImageTag,
}

impl ImageReference {
    pub fn new(name: impl Into<String>, tag: ImageTag) -> Self {
        Self {
            name: name.into(),
            tag,
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = ProvisionError;

    /// Parses `name[:tag]`. The tag separator is the last `:` after the last `/`,
    /// so registry ports (`localhost:5001/img`) are kept in the name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let last_segment_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match s[last_segment_start..].rfind(':') {
            Some(i) => {
                let split = last_segment_start + i;
                (&s[..split], ImageTag::new(&s[split + 1..])?)
            }
            None => (s, ImageTag::latest()),
        };
        if name.is_empty() {
            return Err(ProvisionError::InvalidReference(s.to_string()));
        }
        Ok(Self::new(name, tag))
    }
}

/// Target platform for pulls and image configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }
}

/// A single layer of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub media_type: String,
    /// Digest of the blob as stored (compressed).
    pub digest: Digest,
    /// Digest of the uncompressed tar.
    pub diff_id: Digest,
    pub size: u64,
}

/// An image identified by its manifest digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAddressedImage {
    pub reference: ImageReference,
    /// Manifest digest; the canonical identity of the image.
    pub digest: Digest,
    pub layers: Vec<LayerDescriptor>,
}

impl ContentAddressedImage {
    pub fn name(&self) -> &str {
        &self.reference.name
    }

    pub fn tag(&self) -> &ImageTag {
        &self.reference.tag
    }

    /// `name@sha256:...`, independent of tag mutability.
    pub fn pinned(&self) -> String {
        format!("{}@{}", self.reference.name, self.digest)
    }
}

/// A deployable worker image: toolchain plus the main executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerImage {
    pub flavor: ToolchainFlavor,
    pub image: ContentAddressedImage,
    pub executable_digest: Digest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_validation() {
        assert!(ImageTag::new("latest").is_ok());
        assert!(ImageTag::new("0f3a_b.c-d").is_ok());
        assert!(ImageTag::new("").is_err());
        assert!(ImageTag::new("-leading").is_err());
        assert!(ImageTag::new("has/slash").is_err());
        assert!(ImageTag::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_reference_display() {
        let r = ImageReference::new("rbe-autogen-lre-cc", ImageTag::new("t1").unwrap());
        assert_eq!(r.to_string(), "rbe-autogen-lre-cc:t1");
    }

    #[test]
    fn test_reference_parse_keeps_registry_port() {
        let r: ImageReference = "localhost:5001/lre-cc:abc".parse().unwrap();
        assert_eq!(r.name, "localhost:5001/lre-cc");
        assert_eq!(r.tag.as_str(), "abc");

        let untagged: ImageReference = "localhost:5001/lre-cc".parse().unwrap();
        assert_eq!(untagged.name, "localhost:5001/lre-cc");
        assert_eq!(untagged.tag, ImageTag::latest());
    }

    #[test]
    fn test_reference_parse_rejects_empty_name() {
        assert!(":tag".parse::<ImageReference>().is_err());
    }

    #[test]
    fn test_pinned_uses_digest() {
        let digest = Digest::compute(b"manifest");
        let image = ContentAddressedImage {
            reference: ImageReference::new("legacy", ImageTag::latest()),
            digest,
            layers: vec![],
        };
        assert_eq!(image.pinned(), format!("legacy@{}", digest));
    }
}
