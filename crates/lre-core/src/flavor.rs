//! Toolchain flavors and their static wiring.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// A supported compiler/runtime ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolchainFlavor {
    /// C/C++ toolchain (clang, lld, libc).
    #[serde(rename = "cc")]
    NativeCompiler,

    /// JVM toolchain.
    #[serde(rename = "java")]
    ManagedRuntime,

    /// Pre-existing base image without a custom toolchain.
    #[serde(rename = "legacy")]
    Legacy,
}

/// Which config kind the generator should emit for a flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Cpp,
    Java,
}

impl ConfigKind {
    /// Generator flags enabling exactly this config kind and disabling the other.
    pub fn generator_flags(self) -> [String; 2] {
        let (cpp, java) = match self {
            ConfigKind::Cpp => (true, false),
            ConfigKind::Java => (false, true),
        };
        [
            format!("--generate_cpp_configs={cpp}"),
            format!("--generate_java_configs={java}"),
        ]
    }
}

/// Static names and directories for one flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlavorProfile {
    pub flavor: ToolchainFlavor,
    /// Image name of the disposable introspection image, if the flavor has one.
    pub autogen_name: Option<&'static str>,
    /// Logical image name the generated configs must reference.
    pub deploy_name: &'static str,
    /// Image name of the composed worker image.
    pub worker_name: &'static str,
    /// Output subdirectory under the LRE area.
    pub output_subdir: Option<&'static str>,
    pub config_kind: Option<ConfigKind>,
}

const CC_PROFILE: FlavorProfile = FlavorProfile {
    flavor: ToolchainFlavor::NativeCompiler,
    autogen_name: Some("rbe-autogen-lre-cc"),
    deploy_name: "lre-cc",
    worker_name: "lre-worker-cc",
    output_subdir: Some("generated-cc"),
    config_kind: Some(ConfigKind::Cpp),
};

const JAVA_PROFILE: FlavorProfile = FlavorProfile {
    flavor: ToolchainFlavor::ManagedRuntime,
    autogen_name: Some("rbe-autogen-lre-java"),
    deploy_name: "lre-java",
    worker_name: "lre-worker-java",
    output_subdir: Some("generated-java"),
    config_kind: Some(ConfigKind::Java),
};

const LEGACY_PROFILE: FlavorProfile = FlavorProfile {
    flavor: ToolchainFlavor::Legacy,
    autogen_name: None,
    deploy_name: "legacy",
    worker_name: "lre-worker-legacy",
    output_subdir: None,
    config_kind: None,
};

impl ToolchainFlavor {
    /// All flavors, in pipeline order.
    pub const ALL: [ToolchainFlavor; 3] = [
        ToolchainFlavor::NativeCompiler,
        ToolchainFlavor::ManagedRuntime,
        ToolchainFlavor::Legacy,
    ];

    /// Short stable identifier (`cc`, `java`, `legacy`).
    pub fn id(&self) -> &'static str {
        match self {
            ToolchainFlavor::NativeCompiler => "cc",
            ToolchainFlavor::ManagedRuntime => "java",
            ToolchainFlavor::Legacy => "legacy",
        }
    }

    pub fn profile(&self) -> &'static FlavorProfile {
        match self {
            ToolchainFlavor::NativeCompiler => &CC_PROFILE,
            ToolchainFlavor::ManagedRuntime => &JAVA_PROFILE,
            ToolchainFlavor::Legacy => &LEGACY_PROFILE,
        }
    }

    /// Whether this flavor goes through autogen and config generation.
    pub fn has_autogen(&self) -> bool {
        self.profile().autogen_name.is_some()
    }
}

impl fmt::Display for ToolchainFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ToolchainFlavor {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cc" | "native-compiler" => Ok(ToolchainFlavor::NativeCompiler),
            "java" | "managed-runtime" => Ok(ToolchainFlavor::ManagedRuntime),
            "legacy" => Ok(ToolchainFlavor::Legacy),
            other => Err(ProvisionError::Config(crate::error::ConfigError::Invalid {
                field: "flavor".to_string(),
                reason: format!("unknown flavor '{other}' (expected cc, java or legacy)"),
            })),
        }
    }
}
