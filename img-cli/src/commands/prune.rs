//! `img prune`: clears the build cache.

use anyhow::{Context, Result};
use colored::Colorize;
use img_core::builder::Builder;
use img_core::Config;

/// Drops every cache entry and the blobs no named image still uses.
pub fn prune(config: Config) -> Result<()> {
    let builder = Builder::open(config).context("Failed to open build state")?;
    let stats = builder.prune().context("Failed to prune build state")?;

    println!("{}", "Pruned build state".green().bold());
    println!("  Cache entries removed: {}", stats.cache_entries.to_string().yellow());
    println!("  Blobs removed:         {}", stats.blobs.to_string().yellow());
    Ok(())
}
