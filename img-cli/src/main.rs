use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use img_core::Config;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "img")]
#[command(about = "Daemonless container image builder", long_about = None)]
struct Cli {
    /// State directory (blobs, cache, named images)
    #[arg(long, global = true, env = img_core::paths::STATE_DIR_ENV)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a build script
    Build(commands::build::BuildArgs),

    /// List named images
    Ls,

    /// Clear the build cache and unreferenced blobs
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let state = cli.state.unwrap_or_else(img_core::paths::state_dir);
    let config = Config::load(&state).with_context(|| format!("Failed to load config from {}", state.display()))?;

    if let Err(e) = img_core::init_observability(&config.log_level) {
        eprintln!("warning: logging disabled: {}", e);
    }
    tracing::debug!(state = %state.display(), max_workers = config.max_workers, "Loaded configuration");

    match cli.command {
        Commands::Build(args) => commands::build::build(config, args).await?,
        Commands::Ls => commands::ls::ls(config)?,
        Commands::Prune => commands::prune::prune(config)?,
    }

    Ok(())
}
