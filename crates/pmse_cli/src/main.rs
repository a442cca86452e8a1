//! pmse CLI
//!
//! Command-line tools for pmse data directories.
//!
//! # Commands
//!
//! - `inspect` - Display collections, indexes and pool usage
//! - `verify` - Check every pool without modifying it
//! - `repair` - Run the repair pass on the files in place

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// pmse command-line data directory tools.
#[derive(Parser)]
#[command(name = "pmse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display collections, indexes and pool usage
    Inspect {
        /// Show heap usage of every pool
        #[arg(long)]
        pools: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every pool without modifying it
    Verify {
        /// Check only the metadata pool
        #[arg(short, long)]
        metadata_only: bool,
    },

    /// Run the repair pass on the files in place
    Repair {
        /// Delete pool files no identifier lists
        #[arg(long)]
        remove_orphans: bool,

        /// Dry run - report what would be repaired
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { pools, format } => {
            let path = cli.path.ok_or("Data directory path required for inspect")?;
            commands::inspect::run(&path, pools, &format)?;
        }
        Commands::Verify { metadata_only } => {
            let path = cli.path.ok_or("Data directory path required for verify")?;
            commands::verify::run(&path, metadata_only)?;
        }
        Commands::Repair {
            remove_orphans,
            dry_run,
        } => {
            let path = cli.path.ok_or("Data directory path required for repair")?;
            commands::repair::run(&path, remove_orphans, dry_run)?;
        }
        Commands::Version => {
            println!("pmse CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("pmse core v{}", pmse_core::VERSION);
        }
    }

    Ok(())
}
