//! Build a test-ready disk image.

use anyhow::{Context, Result};
use imgtest_core::{DiskConfig, DiskTemplateBuilder, HostTools};
use std::path::PathBuf;

/// Run the make-disk command.
pub async fn run(config: DiskConfig, input: PathBuf, output: PathBuf) -> Result<()> {
    println!("Building {} from {}...", output.display(), input.display());

    let target = output.clone();
    tokio::task::spawn_blocking(move || {
        let tools = HostTools::new(config.tools.clone());
        DiskTemplateBuilder::new(&tools, config).build(&input, &output)
    })
    .await
    .context("Disk template task panicked")?
    .with_context(|| format!("Failed to build disk template {}", target.display()))?;

    println!("Disk template ready: {}", target.display());
    Ok(())
}
