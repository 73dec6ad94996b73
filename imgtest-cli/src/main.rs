//! # imgtest
//!
//! Operator CLI for OS image test runs.
//!
//! ## Commands
//!
//! - `make-disk`: Copy a base disk image and patch it for serial console boot
//! - `run`: Run native test functions on every machine of a cluster
//! - `drop`: Copy a file to the home directory of every machine
//! - `check-config`: Validate a configuration file
//!
//! ## Example
//!
//! ```bash
//! # Prepare the boot image (needs root for loop devices and mount)
//! sudo imgtest make-disk --input base.img --output test.img
//!
//! # Run the configured native functions on every machine
//! imgtest run --config imgtest.toml --parallel
//!
//! # Same, against in-memory machines
//! imgtest --mock run --config imgtest.toml --json
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgtest_core::HarnessConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{check_config, drop, make_disk, run};

/// Operator CLI for OS image test runs.
#[derive(Parser, Debug)]
#[command(name = "imgtest")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Use in-memory machines instead of SSH (for testing/demo)
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy a base disk image and patch its OEM partition
    MakeDisk {
        /// Base disk image
        #[arg(long, short)]
        input: PathBuf,

        /// Patched image to create
        #[arg(long, short)]
        output: PathBuf,

        /// Configuration file for disk parameters
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Run native test functions on every machine
    Run {
        /// Configuration file
        #[arg(long, short, default_value = "imgtest.toml")]
        config: PathBuf,

        /// Dispatch every (machine, function) pair concurrently
        #[arg(long)]
        parallel: bool,

        /// Print the test tree as JSON
        #[arg(long)]
        json: bool,
    },

    /// Copy a file to the home directory of every machine
    Drop {
        /// Configuration file
        #[arg(long, short, default_value = "imgtest.toml")]
        config: PathBuf,

        /// File to copy
        file: PathBuf,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Configuration file
        #[arg(long, short, default_value = "imgtest.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::MakeDisk {
            input,
            output,
            config,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => HarnessConfig::default(),
            };
            make_disk::run(config.disk, input, output).await?;
        }
        Commands::Run {
            config,
            parallel,
            json,
        } => {
            let config = load_config(&config)?;
            let report = run::run(&config, cli.mock, parallel).await?;
            run::print_report(&report, json)?;
            let failed = report.failed_leaves();
            if failed > 0 {
                anyhow::bail!("{} native test(s) failed", failed);
            }
        }
        Commands::Drop { config, file } => {
            let config = load_config(&config)?;
            drop::run(&config, file, cli.mock).await?;
        }
        Commands::CheckConfig { config } => {
            let config = load_config(&config)?;
            check_config::run(&config);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<HarnessConfig> {
    HarnessConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}
