//! LRE - toolchain image provisioning CLI
//!
//! The `lre` command builds the hermetic toolchain images used for local and
//! remote build execution, generates their platform configs and renders the
//! scheduler deployment.
//!
//! ## Commands
//!
//! - `generate`: Regenerate platform configs for every enabled flavor
//! - `tag`: Print the content tag a flavor's images would carry
//! - `compose`: Build a flavor's worker image and load or push it
//! - `rewrite`: Replace an image name across a config tree
//! - `topology`: Validate or render the scheduler deployment

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lre_core::telemetry::init_tracing;
use lre_core::{source_root, ToolchainFlavor};
use lre_pipeline::{Orchestrator, PipelineContext, Publish};
use lre_topology::{render, DeploymentTopology};
use serde::Serialize;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "lre")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Local Remote Execution toolchain provisioning", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and reports
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Regenerate the platform configs of every enabled flavor
    Generate,

    /// Print the content tag of a flavor's images for the current sources
    Tag {
        /// Flavor: cc, java or legacy
        #[arg(value_parser = parse_flavor)]
        flavor: ToolchainFlavor,
    },

    /// Compose a flavor's worker image
    Compose {
        /// Flavor: cc, java or legacy
        #[arg(value_parser = parse_flavor)]
        flavor: ToolchainFlavor,

        /// Push to this registry instead of loading into the local daemon
        #[arg(long)]
        push: Option<String>,

        /// Skip TLS verification when pushing
        #[arg(long, requires = "push")]
        no_tls_verify: bool,

        /// Leave the image in its OCI layout
        #[arg(long, conflicts_with = "push")]
        no_load: bool,
    },

    /// Replace every occurrence of an image name under a directory
    Rewrite {
        /// Config tree to rewrite in place
        dir: PathBuf,

        /// Name to replace
        #[arg(long)]
        from: String,

        /// Replacement name
        #[arg(long)]
        to: String,
    },

    /// Scheduler deployment topology
    Topology {
        #[command(subcommand)]
        action: TopologyAction,
    },
}

#[derive(Subcommand)]
enum TopologyAction {
    /// Check a topology file without rendering it
    Validate {
        /// Topology file (TOML)
        file: PathBuf,
    },

    /// Render the scheduler ConfigMap, Deployment and Service as YAML
    Render {
        /// Topology file (TOML)
        file: PathBuf,

        /// Write the manifests here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_flavor(s: &str) -> std::result::Result<ToolchainFlavor, String> {
    s.parse().map_err(|e: lre_core::ProvisionError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Generate => cmd_generate(cli.json).await,
        Commands::Tag { flavor } => cmd_tag(flavor).await,
        Commands::Compose {
            flavor,
            push,
            no_tls_verify,
            no_load,
        } => cmd_compose(flavor, push, !no_tls_verify, no_load, cli.json).await,
        Commands::Rewrite { dir, from, to } => cmd_rewrite(&dir, &from, &to, cli.json),
        Commands::Topology { action } => match action {
            TopologyAction::Validate { file } => cmd_topology_validate(&file),
            TopologyAction::Render { file, output } => {
                cmd_topology_render(&file, output.as_deref())
            }
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Orchestrator for the repository containing the working directory.
fn orchestrator() -> Result<Orchestrator> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let root = source_root(&cwd).context("Not inside a git work tree")?;
    let ctx = PipelineContext::discover(&root)
        .with_context(|| format!("Failed to load pipeline config from {}", root.display()))?;
    Ok(Orchestrator::new(ctx))
}

async fn cmd_generate(json: bool) -> Result<()> {
    let orchestrator = orchestrator()?;
    let report = orchestrator
        .generate()
        .await
        .context("Platform config generation failed")?;

    if json {
        return print_json(&report);
    }

    println!("Run:        {}", report.run_id);
    println!(
        "Executable: {} ({})",
        report.executable.name, report.executable.digest
    );
    for outcome in &report.flavors {
        println!();
        println!("[{}]", outcome.flavor);
        println!("  tag:   {}", outcome.tag);
        println!("  base:  {}", outcome.base_image.pinned());
        if let Some(config) = &outcome.config {
            println!("  config: {}", config.root().display());
        }
        if let Some(rewrite) = &outcome.rewrite {
            println!(
                "  rewrite: {} replacement(s) in {} file(s)",
                rewrite.replacements,
                rewrite.files_changed.len()
            );
        }
    }
    println!();
    println!("Done in {} ms", report.duration_ms);
    Ok(())
}

async fn cmd_tag(flavor: ToolchainFlavor) -> Result<()> {
    let orchestrator = orchestrator()?;
    let tag = orchestrator
        .resolve_tag(flavor)
        .await
        .with_context(|| format!("Failed to resolve tag for {flavor}"))?;
    println!("{tag}");
    Ok(())
}

/// Push wins over load; `load_worker_images` decides when neither is given.
fn publish_mode(push: Option<String>, tls_verify: bool, no_load: bool, load_default: bool) -> Publish {
    match push {
        Some(registry) => Publish::Push {
            registry,
            tls_verify,
        },
        None if !no_load && load_default => Publish::Load,
        None => Publish::None,
    }
}

async fn cmd_compose(
    flavor: ToolchainFlavor,
    push: Option<String>,
    tls_verify: bool,
    no_load: bool,
    json: bool,
) -> Result<()> {
    let orchestrator = orchestrator()?;
    let publish = publish_mode(
        push,
        tls_verify,
        no_load,
        orchestrator.context().config.load_worker_images,
    );
    let report = orchestrator
        .compose(flavor, publish)
        .await
        .with_context(|| format!("Failed to compose worker image for {flavor}"))?;

    if json {
        return print_json(&report);
    }

    println!("Worker:     {}", report.summary.reference);
    println!("Pinned:     {}", report.summary.pinned);
    println!("Executable: {}", report.summary.worker.executable_digest);
    match &report.summary.published_to {
        Some(target) => println!("Published:  {target}"),
        None => println!("Published:  (layout only)"),
    }
    Ok(())
}

fn cmd_rewrite(dir: &Path, from: &str, to: &str, json: bool) -> Result<()> {
    let report = lre_core::rewrite::rewrite(dir, from, to)
        .with_context(|| format!("Failed to rewrite {}", dir.display()))?;
    lre_core::rewrite::verify(dir, from)
        .with_context(|| format!("'{from}' still present after rewrite"))?;

    if json {
        return print_json(&report);
    }

    println!(
        "Rewrote '{}' -> '{}': {} replacement(s) in {} of {} file(s)",
        report.from,
        report.to,
        report.replacements,
        report.files_changed.len(),
        report.files_scanned
    );
    for file in &report.files_changed {
        println!("  {}", file.display());
    }
    Ok(())
}

fn load_topology(file: &Path) -> Result<DeploymentTopology> {
    DeploymentTopology::from_file(file)
        .with_context(|| format!("Failed to load topology {}", file.display()))
}

fn topology_base_dir(file: &Path) -> &Path {
    file.parent().unwrap_or_else(|| Path::new("."))
}

fn cmd_topology_validate(file: &Path) -> Result<()> {
    let topology = load_topology(file)?;
    topology.validate().context("Topology is invalid")?;
    println!(
        "✓ {} ({} worker pool(s)) in namespace {}",
        topology.scheduler.name,
        topology.worker_pools.len(),
        topology.namespace
    );
    Ok(())
}

fn cmd_topology_render(file: &Path, output: Option<&Path>) -> Result<()> {
    let topology = load_topology(file)?;
    let manifests = render(&topology, topology_base_dir(file)).context("Failed to render topology")?;
    let yaml = manifests.to_yaml()?;

    match output {
        Some(path) => {
            std::fs::write(path, &yaml)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "wrote manifests");
        }
        None => print!("{yaml}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compose_push() {
        let cli = Cli::try_parse_from([
            "lre",
            "compose",
            "cc",
            "--push",
            "registry.local:5000",
            "--no-tls-verify",
        ])
        .unwrap();
        match cli.command {
            Commands::Compose {
                flavor,
                push,
                no_tls_verify,
                no_load,
            } => {
                assert_eq!(flavor, ToolchainFlavor::NativeCompiler);
                assert_eq!(push.as_deref(), Some("registry.local:5000"));
                assert!(no_tls_verify);
                assert!(!no_load);
            }
            _ => panic!("expected compose"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_flavor() {
        assert!(Cli::try_parse_from(["lre", "tag", "rust"]).is_err());
    }

    #[test]
    fn test_push_conflicts_with_no_load() {
        assert!(Cli::try_parse_from(["lre", "compose", "java", "--push", "r", "--no-load"]).is_err());
        assert!(Cli::try_parse_from(["lre", "compose", "java", "--no-tls-verify"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["lre", "generate", "--json", "-v"]).unwrap();
        assert!(cli.json);
        assert!(cli.verbose);
    }

    #[test]
    fn test_publish_mode() {
        assert_eq!(publish_mode(None, true, false, true), Publish::Load);
        assert_eq!(publish_mode(None, true, true, true), Publish::None);
        assert_eq!(publish_mode(None, true, false, false), Publish::None);
        assert_eq!(
            publish_mode(Some("r".to_string()), false, false, true),
            Publish::Push {
                registry: "r".to_string(),
                tls_verify: false
            }
        );
    }

    #[test]
    fn test_cmd_rewrite_replaces_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(
            dir.path().join("config/BUILD"),
            "container-image = \"docker://lre-cc-autogen:abc\"\n",
        )
        .unwrap();

        cmd_rewrite(dir.path(), "lre-cc-autogen", "lre-cc", false).unwrap();
        let build = std::fs::read_to_string(dir.path().join("config/BUILD")).unwrap();
        assert_eq!(build, "container-image = \"docker://lre-cc:abc\"\n");
    }

    #[test]
    fn test_cmd_topology_render_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("topology.toml");
        std::fs::write(
            &file,
            r#"
            [scheduler]
            image = "ghcr.io/stevedores-org/rbe-server:1.0"

            [cas_endpoint]
            address = "grpc://cas:50051"

            [scheduler_config]
            config_map = "scheduler-config"
            "#,
        )
        .unwrap();
        let out = dir.path().join("manifests.yaml");

        cmd_topology_validate(&file).unwrap();
        cmd_topology_render(&file, Some(&out)).unwrap();
        let yaml = std::fs::read_to_string(&out).unwrap();
        assert!(yaml.contains("kind: Deployment"));
        assert!(yaml.contains("- /scheduler.json"));
        assert!(!yaml.contains("kind: ConfigMap"));
    }

    #[test]
    fn test_cmd_topology_validate_reports_missing_cas() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("topology.toml");
        std::fs::write(
            &file,
            "[scheduler]\nimage = \"rbe\"\n[scheduler_config]\nconfig_map = \"c\"\n",
        )
        .unwrap();
        let err = cmd_topology_validate(&file).unwrap_err();
        assert!(format!("{err:#}").contains("Topology is invalid"));
    }
}
