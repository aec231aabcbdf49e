//! firemirror CLI
//!
//! Command-line tools for inspecting and maintaining local replicas.
//!
//! # Commands
//!
//! - `inspect` - Display replica statistics and keys
//! - `verify` - Verify replica integrity
//! - `wipe` - Delete a replica from disk
//! - `keygen` - Generate push ids

mod commands;
mod error;

use clap::{Parser, Subcommand};
use error::{CliError, CliResult};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// firemirror command-line replica tools.
#[derive(Parser)]
#[command(name = "firemirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding replica files
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// Namespace (remote path) of the replica
    #[arg(global = true, short, long)]
    namespace: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display replica statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// List every key
        #[arg(short, long)]
        keys: bool,
    },

    /// Verify replica integrity
    Verify,

    /// Delete the replica files
    Wipe {
        /// Skip the lock check
        #[arg(short, long)]
        force: bool,
    },

    /// Generate push ids
    Keygen {
        /// Number of ids to generate
        #[arg(short, long, default_value = "1")]
        count: usize,
    },

    /// Show version information
    Version,
}

impl Cli {
    fn target(&self, command: &str) -> CliResult<(PathBuf, String)> {
        let missing = |argument| CliError::MissingArgument {
            command: command.to_string(),
            argument,
        };
        let dir = self.dir.clone().ok_or_else(|| missing("--dir"))?;
        let namespace = self.namespace.clone().ok_or_else(|| missing("--namespace"))?;
        Ok((dir, namespace))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Inspect { format, keys } => {
            let (dir, namespace) = cli.target("inspect")?;
            commands::inspect::run(&dir, &namespace, format, *keys)?;
        }
        Commands::Verify => {
            let (dir, namespace) = cli.target("verify")?;
            commands::verify::run(&dir, &namespace)?;
        }
        Commands::Wipe { force } => {
            let (dir, namespace) = cli.target("wipe")?;
            commands::wipe::run(&dir, &namespace, *force)?;
        }
        Commands::Keygen { count } => {
            commands::keygen::run(*count);
        }
        Commands::Version => {
            println!("firemirror CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Replica format v{}", firemirror_storage::format::REPLICA_VERSION);
        }
    }

    Ok(())
}
