//! [`ConfigGenerator`] over `rbe_configs_gen`.

use std::sync::Arc;

use async_trait::async_trait;
use lre_core::{CommandRunner, CommandSpec, GeneratorConfig, ProvisionError, Result};
use tracing::info;

use super::{ConfigGenerator, GenerateRequest};

/// Command-line arguments for one generator run.
pub fn generator_args(config: &GeneratorConfig, request: &GenerateRequest) -> Vec<String> {
    let mut args = vec![
        format!("--toolchain_container={}", request.toolchain_container),
        format!("--exec_os={}", config.exec_os),
        format!("--target_os={}", config.target_os),
        format!("--bazel_version={}", config.bazel_version),
        format!("--bazel_path={}", config.bazel_path),
        format!("--output_src_root={}", request.source_root.display()),
        format!(
            "--output_config_path={}",
            request.output_config_path.display()
        ),
    ];
    args.extend(request.kind.generator_flags());
    args
}

/// Runs the external generator binary.
#[derive(Clone)]
pub struct RbeConfigsGen {
    runner: Arc<dyn CommandRunner>,
    config: GeneratorConfig,
    timeout_secs: u64,
}

impl RbeConfigsGen {
    pub fn new(runner: Arc<dyn CommandRunner>, config: GeneratorConfig) -> Self {
        Self {
            runner,
            config,
            timeout_secs: 0,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[async_trait]
impl ConfigGenerator for RbeConfigsGen {
    async fn generate(&self, request: &GenerateRequest) -> Result<()> {
        let spec = CommandSpec::new(&self.config.binary)
            .args(generator_args(&self.config, request))
            .current_dir(&request.source_root)
            .timeout_secs(self.timeout_secs);

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| ProvisionError::Generation {
                flavor: request.flavor.to_string(),
                reason: e.to_string(),
            })?;
        if !output.success() {
            return Err(ProvisionError::Generation {
                flavor: request.flavor.to_string(),
                reason: format!(
                    "{} exited with code {}: {}",
                    self.config.binary,
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }

        info!(
            flavor = %request.flavor,
            output = %request.output_config_path.display(),
            "generated platform config"
        );
        Ok(())
    }
}
