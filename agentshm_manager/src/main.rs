use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentshm_core::AgentShmConfig;

mod commands;

#[derive(Parser)]
#[command(name = "agentshm")]
#[command(about = "Inspect and clean up AgentShm shared memory pools")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding the shared objects (defaults to the platform shm dir)
    #[arg(short = 'd', long = "dir", global = true, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Agent configuration file (TOML or YAML)
    #[arg(short = 'c', long = "config", global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pools present in the shared memory directory
    List,

    /// Show occupancy of a pool
    Info {
        /// Logical pool name
        name: String,
        /// Print as JSON
        #[arg(long = "json")]
        json: bool,
        /// Include the chunk chain
        #[arg(long = "chunks")]
        chunks: bool,
    },

    /// Check a pool's chunk chain and free lists for consistency
    Verify {
        /// Logical pool name
        name: String,
    },

    /// Remove objects left behind by a crashed agent instance
    Recover {
        /// Instance id (defaults to the one in --config)
        #[arg(short = 'i', long = "instance")]
        instance: Option<u64>,
    },

    /// Remove a pool even if other processes are attached
    Destroy {
        /// Logical pool name
        name: String,
        /// Unlink without attaching, for pools that cannot be opened
        #[arg(short = 'f', long = "force")]
        force: bool,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentshm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_command(cli: Cli) -> anyhow::Result<()> {
    let file_config = cli
        .config
        .as_deref()
        .map(AgentShmConfig::from_file)
        .transpose()?;
    let instance_from_file = file_config.as_ref().map(|c| c.instance_id);

    let mut pool_config = file_config.map(|c| c.pool).unwrap_or_default();
    if let Some(dir) = cli.dir {
        pool_config.shm_dir = Some(dir);
    }
    tracing::debug!("Using shared memory directory {}", pool_config.dir().display());

    match cli.command {
        Commands::List => commands::execute_list(&pool_config),
        Commands::Info { name, json, chunks } => {
            commands::execute_info(&pool_config, &name, json, chunks)
        }
        Commands::Verify { name } => commands::execute_verify(&pool_config, &name),
        Commands::Recover { instance } => {
            let instance = instance.or(instance_from_file).ok_or_else(|| {
                anyhow::anyhow!("no instance id given; pass --instance or --config")
            })?;
            commands::execute_recover(&pool_config, instance)
        }
        Commands::Destroy { name, force } => commands::execute_destroy(&pool_config, &name, force),
    }
}
