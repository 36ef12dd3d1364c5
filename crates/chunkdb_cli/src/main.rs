//! chunkdb CLI
//!
//! Command-line tools for chunkdb store files.
//!
//! # Commands
//!
//! - `inspect` - Display store size, chunk and free space statistics
//! - `verify` - Check tiling, chain consistency and reachability
//! - `defragment` - Merge chains, fill free space and pack the store
//! - `dump` - List the reference slots of the live graph

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// chunkdb command-line store tools.
#[derive(Parser)]
#[command(name = "chunkdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
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
    /// Display store statistics
    Inspect {
        /// List every chunk in address order
        #[arg(short, long)]
        chunks: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify store integrity
    Verify,

    /// Compact the store
    Defragment {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump the live reference graph
    Dump {
        /// Maximum number of slots to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { chunks, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, chunks, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Defragment { dry_run } => {
            let path = cli.path.ok_or("Store path required for defragment")?;
            commands::defragment::run(&path, dry_run)?;
        }
        Commands::Dump { limit, format } => {
            let path = cli.path.ok_or("Store path required for dump")?;
            commands::dump::run(&path, limit, &format)?;
        }
        Commands::Version => {
            println!("chunkdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("chunkdb Core v{}", chunkdb_core::VERSION);
        }
    }

    Ok(())
}
