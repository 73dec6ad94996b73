//! # imgtest-agent
//!
//! Test payload dropped onto machines under test.
//!
//! The harness invokes it from the remote home directory:
//!
//! ```bash
//! ./imgtest-agent run <test> <function>
//! ./imgtest-agent list
//! ```
//!
//! Exit status is zero on success. Everything the function prints, and any
//! failure, goes to stdout/stderr, which the harness captures as one stream.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod checks;

/// Runs native test functions on a machine under test.
#[derive(Parser, Debug)]
#[command(name = "imgtest-agent")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one native function
    Run {
        /// Name of the test requesting the run
        test: String,
        /// Native function to run
        function: String,
    },

    /// List available native functions
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let cli = Cli::parse();
    let registry = checks::registry();

    match cli.command {
        Commands::Run { test, function } => {
            registry
                .run(&test, &function)
                .with_context(|| format!("{test}: {function}"))?;
        }
        Commands::List => {
            for name in registry.names() {
                println!("{name}");
            }
        }
    }

    Ok(())
}
