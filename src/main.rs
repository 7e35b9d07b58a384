//! Genome Loader identity tool
//!
//! Deployment helper around the identity layer:
//! - `provision [--clean]` creates lock files and the identifier table
//! - `allocate <entity-type> <raw-key>...` allocates (or reuses) stable
//!   identifiers and prints them as JSON lines
//!
//! Configuration comes from `GENOME_LOADER_*` variables or a `.env` file,
//! or from a YAML file given with `--config <path>`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::task;
use tracing::info;
use tracing_subscriber::EnvFilter;

use genome_loader::{EntityType, IdentityLayer, LoaderConfig};

/// Stable identifier tooling for the genome annotation loader.
#[derive(Debug, Parser)]
#[command(name = "genome_loader")]
#[command(version, about, long_about = None)]
struct Cli {
    /// YAML loader config; environment variables are used when absent.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create lock files and the identifier table.
    Provision {
        /// Drop every existing allocation.
        #[arg(long)]
        clean: bool,
    },
    /// Allocate or reuse stable identifiers, printed as JSON lines.
    Allocate {
        #[arg(value_enum)]
        entity: EntityType,
        #[arg(required = true, num_args = 1..)]
        raw_keys: Vec<String>,
    },
}

impl Cli {
    fn loader_config(&self) -> Result<LoaderConfig> {
        match &self.config {
            Some(path) => LoaderConfig::from_yaml_file(path),
            None => LoaderConfig::from_env(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("genome_loader=info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let layer = IdentityLayer::open(cli.loader_config()?)?;

    // File locks and SQLite calls block; keep them off the runtime threads.
    task::spawn_blocking(move || -> Result<()> {
        match cli.command {
            Commands::Provision { clean } => {
                layer.provision(clean)?;
                info!("Provisioning complete");
            }
            Commands::Allocate { entity, raw_keys } => {
                let allocated = layer.allocator()?.allocate_all(entity, raw_keys.as_slice())?;
                for record in &allocated {
                    println!("{}", serde_json::to_string(record)?);
                }
                info!("Allocated {} {} identifiers", allocated.len(), entity);
            }
        }
        Ok(())
    })
    .await??;

    Ok(())
}
