//! OCI provenance labels stamped onto every deployment image.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

pub const LABEL_DESCRIPTION: &str = "org.opencontainers.image.description";
pub const LABEL_DOCUMENTATION: &str = "org.opencontainers.image.documentation";
pub const LABEL_LICENSES: &str = "org.opencontainers.image.licenses";
pub const LABEL_REVISION: &str = "org.opencontainers.image.revision";
pub const LABEL_SOURCE: &str = "org.opencontainers.image.source";
pub const LABEL_TITLE: &str = "org.opencontainers.image.title";
pub const LABEL_VENDOR: &str = "org.opencontainers.image.vendor";

/// Digest of the main executable baked into a worker image.
pub const LABEL_EXECUTABLE_DIGEST: &str = "io.lre.executable.digest";

/// Values for the OCI annotation labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OciLabels {
    pub description: String,
    pub documentation: String,
    pub licenses: String,
    pub revision: String,
    pub source: String,
    pub title: String,
    pub vendor: String,
}

impl Default for OciLabels {
    fn default() -> Self {
        Self {
            description: "Remote build execution toolchain image".to_string(),
            documentation: "https://docs.stevedores.org/lre-provision".to_string(),
            licenses: "Apache-2.0".to_string(),
            revision: "unknown".to_string(),
            source: "https://github.com/stevedores-org/lre-provision".to_string(),
            title: "lre".to_string(),
            vendor: "Stevedores Org".to_string(),
        }
    }
}

impl OciLabels {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_DESCRIPTION.to_string(), self.description.clone()),
            (LABEL_DOCUMENTATION.to_string(), self.documentation.clone()),
            (LABEL_LICENSES.to_string(), self.licenses.clone()),
            (LABEL_REVISION.to_string(), self.revision.clone()),
            (LABEL_SOURCE.to_string(), self.source.clone()),
            (LABEL_TITLE.to_string(), self.title.clone()),
            (LABEL_VENDOR.to_string(), self.vendor.clone()),
        ])
    }

    /// Labels for a worker image, including the executable digest.
    pub fn to_worker_map(&self, executable: &Digest) -> BTreeMap<String, String> {
        let mut map = self.to_map();
        map.insert(LABEL_EXECUTABLE_DIGEST.to_string(), executable.to_string());
        map
    }
}
