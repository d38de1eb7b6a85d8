// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::NeuronConfig;
use neuron::gpu::GpuDetector;
use neuron::Context;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "neuron.toml";

#[derive(Parser)]
#[command(name = "neuron", version, about = "llama.cpp backend control plane")]
struct Cli {
    /// configuration file (defaults to ./neuron.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// log filter used when RUST_LOG is unset, e.g. "debug" or "neuron=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// serve the management and ollama-compatible apis until ctrl-c
    Serve,

    /// print detected gpus and their occupancy
    Gpus,

    /// inspect or repair the process registry
    #[command(subcommand)]
    Registry(RegistryCommand),
}

#[derive(Subcommand, Debug)]
enum RegistryCommand {
    /// print recorded backends
    List,

    /// check every recorded pid against the os process table
    Verify,

    /// list backend processes the registry does not know about
    Orphans,

    /// terminate orphaned backend processes
    Cleanup {
        /// kill immediately instead of SIGTERM first
        #[arg(long)]
        force: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<NeuronConfig> {
    match path {
        Some(path) => config::load_from_file(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_from_file(DEFAULT_CONFIG),
        None => {
            warn!("no {} found; using built-in defaults", DEFAULT_CONFIG);
            Ok(NeuronConfig::default())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    util::logging::init_tracing(cli.log_level.as_deref());

    let config = load_config(cli.config.as_deref())?;
    info!("starting neuron: {:?}", cli.command);

    match cli.command {
        Commands::Serve => neuron::serve(config).await?,
        Commands::Gpus => {
            let detector = GpuDetector::from_config(&config.gpu);
            for gpu in detector.detect().await {
                println!(
                    "gpu {:>2}  {:<17} {:>6}/{:<6} MiB  selectable={}  {}",
                    gpu.index,
                    format!("{:?}", gpu.state),
                    gpu.memory_used_mb,
                    gpu.memory_total_mb,
                    gpu.select_enabled,
                    gpu.model_name.unwrap_or_default()
                );
            }
        }
        Commands::Registry(cmd) => {
            let ctx = Context::build(config)?;
            let registry = &ctx.registry;
            match cmd {
                RegistryCommand::List => print_json(&registry.entries())?,
                RegistryCommand::Verify => print_json(&registry.verify_all())?,
                RegistryCommand::Orphans => {
                    print_json(&registry.find_orphans(registry.executable_name()))?
                }
                RegistryCommand::Cleanup { force } => {
                    let terminated = registry.cleanup_orphans(force).await;
                    println!("terminated {terminated} orphaned backend process(es)");
                }
            }
        }
    }

    Ok(())
}
