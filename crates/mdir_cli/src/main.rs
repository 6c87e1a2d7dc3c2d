//! mdir CLI
//!
//! Operator tools for mdir mirrors, journals and servers.
//!
//! # Commands
//!
//! - `inspect` - Display the folders of a client mirror
//! - `dump-journal` - Print the patches of a folder journal
//! - `verify` - Verify journal integrity and version contiguity
//! - `plan` - Show what the reconciler would do, without doing it
//! - `serve` - Run a sync server in the foreground

mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// mdir command-line tools.
#[derive(Parser)]
#[command(name = "mdir")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the folders of a client mirror
    Inspect {
        /// Mirror root
        mirror: PathBuf,

        /// Identifier of the top folder
        #[arg(long, default_value = "root")]
        root_id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the patches of a folder journal
    DumpJournal {
        /// Journal file, or the folder directory holding it
        journal: PathBuf,

        /// Only patches after this version
        #[arg(long, default_value = "0")]
        from: i64,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify journal integrity
    Verify {
        /// Journal file, or the folder directory holding it
        journal: PathBuf,
    },

    /// Show what the reconciler would do
    Plan {
        /// Mirror root
        mirror: PathBuf,

        /// Only this tree path
        #[arg(long)]
        folder: Option<String>,

        /// Identifier of the top folder
        #[arg(long, default_value = "root")]
        root_id: String,
    },

    /// Run a sync server in the foreground
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:4410")]
        bind: SocketAddr,

        /// Directory for folder journals (in memory if omitted)
        #[arg(short, long)]
        storage: Option<PathBuf>,

        /// Maximum number of open folders
        #[arg(long, default_value_t = mdir_sync_server::DEFAULT_FOLDER_CACHE_CAPACITY)]
        cache_capacity: usize,

        /// Concurrent creation policy (merge, always, reject)
        #[arg(long, default_value = "merge")]
        policy: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            mirror,
            root_id,
            format,
        } => commands::inspect::run(&mirror, &root_id, &format)?,
        Commands::DumpJournal {
            journal,
            from,
            limit,
            format,
        } => commands::dump_journal::run(&journal, from, limit, &format)?,
        Commands::Verify { journal } => commands::verify::run(&journal)?,
        Commands::Plan {
            mirror,
            folder,
            root_id,
        } => commands::plan::run(&mirror, &root_id, folder.as_deref())?,
        Commands::Serve {
            bind,
            storage,
            cache_capacity,
            policy,
        } => commands::serve::run(commands::serve::ServeOptions {
            bind,
            storage,
            cache_capacity,
            policy,
        })?,
        Commands::Version => {
            println!("mdir CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("journal format v{}", mdir_core::journal::JOURNAL_FORMAT);
        }
    }

    Ok(())
}
