//! `img ls`: lists named images in the local store.

use anyhow::{Context, Result};
use colored::Colorize;
use img_core::builder::store::StoredImage;
use img_core::builder::Builder;
use img_core::Config;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "REFERENCE")]
    reference: String,
    #[tabled(rename = "IMAGE ID")]
    image_id: String,
    #[tabled(rename = "PLATFORMS")]
    platforms: String,
    #[tabled(rename = "SIZE")]
    size: String,
}

impl From<&StoredImage> for ImageRow {
    fn from(image: &StoredImage) -> Self {
        Self {
            reference: image.reference.clone(),
            image_id: format_image_id(&image.digest),
            platforms: image.platforms.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(","),
            size: format_size(image.size),
        }
    }
}

/// Lists all named images.
pub fn ls(config: Config) -> Result<()> {
    let builder = Builder::open(config).context("Failed to open build state")?;
    let images = builder.images().list().context("Failed to list images")?;

    if images.is_empty() {
        println!("No images found.");
        println!();
        println!("Build your first image with: {}", "img build -t <name> .".cyan());
        return Ok(());
    }

    let rows: Vec<ImageRow> = images.iter().map(ImageRow::from).collect();
    println!("{}", Table::new(rows));

    Ok(())
}

/// Formats an image ID to short form (first 12 characters).
fn format_image_id(id: &str) -> String {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    hex.chars().take(12).collect()
}

/// Formats size in bytes to human-readable form.
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}
