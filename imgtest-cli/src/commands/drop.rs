//! Copy a file to every machine.

use anyhow::{Context, Result};
use imgtest_core::HarnessConfig;
use std::path::PathBuf;

use super::build_cluster;

/// Run the drop command.
pub async fn run(config: &HarnessConfig, file: PathBuf, use_mock: bool) -> Result<()> {
    let cluster = build_cluster(config, use_mock);
    let count = cluster.machines().len();
    println!("Dropping {} on {} machine(s)...", file.display(), count);

    tokio::task::spawn_blocking(move || cluster.drop_file(&file))
        .await
        .context("Drop task panicked")?
        .context("Failed to drop file")?;

    println!("Done.");
    Ok(())
}
