//! Pipeline configuration.
//!
//! Loaded from an optional `lre.toml` at the source root, then overridden by
//! environment variables:
//!
//! - `LRE_GENERATOR`: path of the config generator binary
//! - `LRE_BAZEL_PATH`: bazel binary passed to the generator
//! - `LRE_PARALLEL`: run flavors concurrently (true|false)
//!
//! Every field has a default, so an empty or missing file is a valid config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::ConfigError;
use crate::flavor::ToolchainFlavor;
use crate::image::Platform;
use crate::labels::OciLabels;

/// File name looked up at the source root.
pub const CONFIG_FILE_NAME: &str = "lre.toml";

/// A flavor's toolchain package set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainDefinition {
    /// Flake attribute realising the package set as a single tree.
    pub attr: String,
    /// Declared packages, recorded for provenance and tag derivation.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Environment written into the image config.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Flake attribute with tools only the introspection image needs.
    #[serde(default)]
    pub autogen_extras: Option<String>,
}

impl ToolchainDefinition {
    /// Built-in package set for a flavor.
    pub fn builtin(flavor: ToolchainFlavor) -> Option<Self> {
        match flavor {
            ToolchainFlavor::NativeCompiler => Some(Self {
                attr: "lre-cc-toolchain".to_string(),
                packages: ["bash", "coreutils", "clang", "lld", "glibc", "gnumake"]
                    .map(String::from)
                    .to_vec(),
                env: BTreeMap::from([
                    ("CC".to_string(), "clang".to_string()),
                    ("CXX".to_string(), "clang++".to_string()),
                    ("PATH".to_string(), "/bin:/usr/bin:/usr/local/bin".to_string()),
                ]),
                autogen_extras: Some("rbe-autogen-extras".to_string()),
            }),
            ToolchainFlavor::ManagedRuntime => Some(Self {
                attr: "lre-java-toolchain".to_string(),
                packages: ["bash", "coreutils", "jdk17_headless"]
                    .map(String::from)
                    .to_vec(),
                env: BTreeMap::from([
                    ("JAVA_HOME".to_string(), "/lib/openjdk".to_string()),
                    ("PATH".to_string(), "/bin:/usr/bin:/usr/local/bin".to_string()),
                ]),
                autogen_extras: Some("rbe-autogen-extras".to_string()),
            }),
            ToolchainFlavor::Legacy => None,
        }
    }
}

/// Settings for one autogen-capable flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutogenFlavorConfig {
    pub enabled: bool,
    /// Overrides the built-in package set.
    pub toolchain: Option<ToolchainDefinition>,
}

impl Default for AutogenFlavorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            toolchain: None,
        }
    }
}

/// A base image pinned by digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImageConfig {
    /// Repository name inside the registry.
    pub name: String,
    pub digest: Digest,
    /// Registry host, e.g. `localhost:5001`.
    pub registry: String,
    /// Verify the registry's TLS certificate. Set per source, never defaulted.
    pub tls_verify: bool,
    #[serde(default)]
    pub platform: Platform,
}

/// Settings for the legacy flavor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyFlavorConfig {
    pub enabled: bool,
    pub base: Option<BaseImageConfig>,
}

/// Per-flavor settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlavorsConfig {
    pub cc: AutogenFlavorConfig,
    pub java: AutogenFlavorConfig,
    pub legacy: LegacyFlavorConfig,
}

/// How the external config generator is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub binary: String,
    pub bazel_version: String,
    pub bazel_path: String,
    pub exec_os: String,
    pub target_os: String,
    /// Environment-mapping file, relative to the flavor output directory.
    pub env_file: PathBuf,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            binary: "rbe_configs_gen".to_string(),
            bazel_version: "7.1.0".to_string(),
            bazel_path: "bazel".to_string(),
            exec_os: "linux".to_string(),
            target_os: "linux".to_string(),
            env_file: PathBuf::from("config/environment.json"),
        }
    }
}

/// Flake attributes producing the main executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutableConfig {
    /// Dependency-only derivation, cached across source-only changes.
    pub deps_attr: String,
    pub attr: String,
    /// Binary name under `<out>/bin/`.
    pub binary: String,
}

impl Default for ExecutableConfig {
    fn default() -> Self {
        Self {
            deps_attr: "rbe-server-deps".to_string(),
            attr: "rbe-server".to_string(),
            binary: "rbe-server".to_string(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory under the source root holding the generated configs.
    pub area: PathBuf,
    /// Scratch directory for OCI layouts, relative to the source root.
    pub work_dir: PathBuf,
    /// Run flavors concurrently.
    pub parallel: bool,
    /// Load worker images into the local daemon after composing them.
    pub load_worker_images: bool,
    /// Per-command timeout in seconds; 0 disables it.
    pub command_timeout_secs: u64,
    pub generator: GeneratorConfig,
    pub executable: ExecutableConfig,
    pub labels: OciLabels,
    pub flavors: FlavorsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            area: PathBuf::from("local-remote-execution"),
            work_dir: PathBuf::from(".lre"),
            parallel: false,
            load_worker_images: true,
            command_timeout_secs: 0,
            generator: GeneratorConfig::default(),
            executable: ExecutableConfig::default(),
            labels: OciLabels::default(),
            flavors: FlavorsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load `lre.toml` from `source_root` (defaults if absent) and apply env overrides.
    pub fn load(source_root: &Path) -> Result<Self, ConfigError> {
        let path = source_root.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `LRE_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(binary) = lookup("LRE_GENERATOR") {
            self.generator.binary = binary;
        }
        if let Some(bazel) = lookup("LRE_BAZEL_PATH") {
            self.generator.bazel_path = bazel;
        }
        if let Some(parallel) = lookup("LRE_PARALLEL") {
            self.parallel = parallel.parse().map_err(|_| ConfigError::Invalid {
                field: "LRE_PARALLEL".to_string(),
                reason: format!("expected true or false, got '{parallel}'"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.area.as_os_str().is_empty() || self.area.is_absolute() {
            return Err(ConfigError::Invalid {
                field: "area".to_string(),
                reason: "must be a non-empty path relative to the source root".to_string(),
            });
        }
        if self.generator.binary.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "generator.binary".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.generator.bazel_version.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "generator.bazel_version".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.executable.binary.trim().is_empty() || self.executable.binary.contains('/') {
            return Err(ConfigError::Invalid {
                field: "executable.binary".to_string(),
                reason: "must be a plain file name".to_string(),
            });
        }
        if self.flavors.legacy.enabled && self.flavors.legacy.base.is_none() {
            return Err(ConfigError::Invalid {
                field: "flavors.legacy.base".to_string(),
                reason: "legacy flavor is enabled but no pinned base image is configured"
                    .to_string(),
            });
        }
        for flavor in self.enabled_flavors() {
            if let Some(toolchain) = self.toolchain(flavor) {
                if toolchain.attr.trim().is_empty() {
                    return Err(ConfigError::Invalid {
                        field: format!("flavors.{flavor}.toolchain.attr"),
                        reason: "must not be empty".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Enabled flavors in pipeline order.
    pub fn enabled_flavors(&self) -> Vec<ToolchainFlavor> {
        ToolchainFlavor::ALL
            .into_iter()
            .filter(|flavor| self.is_enabled(*flavor))
            .collect()
    }

    pub fn is_enabled(&self, flavor: ToolchainFlavor) -> bool {
        match flavor {
            ToolchainFlavor::NativeCompiler => self.flavors.cc.enabled,
            ToolchainFlavor::ManagedRuntime => self.flavors.java.enabled,
            ToolchainFlavor::Legacy => self.flavors.legacy.enabled,
        }
    }

    /// Configured or built-in toolchain for an autogen flavor.
    pub fn toolchain(&self, flavor: ToolchainFlavor) -> Option<ToolchainDefinition> {
        let configured = match flavor {
            ToolchainFlavor::NativeCompiler => self.flavors.cc.toolchain.clone(),
            ToolchainFlavor::ManagedRuntime => self.flavors.java.toolchain.clone(),
            ToolchainFlavor::Legacy => None,
        };
        configured.or_else(|| ToolchainDefinition::builtin(flavor))
    }

    /// `<area>/generated-<flavor>` relative to the source root.
    pub fn output_config_path(&self, flavor: ToolchainFlavor) -> Option<PathBuf> {
        flavor
            .profile()
            .output_subdir
            .map(|subdir| self.area.join(subdir))
    }

    /// Absolute output directory of a flavor.
    pub fn output_dir(&self, source_root: &Path, flavor: ToolchainFlavor) -> Option<PathBuf> {
        self.output_config_path(flavor)
            .map(|relative| source_root.join(relative))
    }

    /// Absolute scratch directory of a flavor.
    pub fn flavor_work_dir(&self, source_root: &Path, flavor: ToolchainFlavor) -> PathBuf {
        source_root.join(&self.work_dir).join(flavor.id())
    }
}
