//! TideSync CLI
//!
//! Command-line front end for a TideSync task database.
//!
//! # Commands
//!
//! - `add`, `list`, `complete`, `reopen`, `postpone`, `delete`, `clear` - Manage tasks
//! - `pending` - Dump the mutation log
//! - `sync` - Upload pending mutations once, or run the scheduler for a while
//! - `watch` - Print the open-task list whenever it changes

mod commands;

use clap::{Parser, Subcommand};
use commands::Context;
use std::path::PathBuf;
use tidesync_sync_engine::EngineConfig;
use tracing_subscriber::EnvFilter;

/// TideSync command-line tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Path to the local database file (overrides the configuration)
    #[arg(global = true, long)]
    db: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a task and print its id
    Add {
        /// Task title
        title: String,

        /// Free-form description
        #[arg(short, long)]
        description: Option<String>,

        /// Priority (low, medium, high)
        #[arg(short, long, default_value = "medium")]
        priority: String,

        /// Due this many hours from now
        #[arg(long)]
        due_in_hours: Option<u64>,
    },

    /// List tasks
    List {
        /// Include completed tasks
        #[arg(short, long)]
        all: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Mark a task completed
    Complete {
        /// Task id
        id: String,
    },

    /// Mark a completed task open again
    Reopen {
        /// Task id
        id: String,
    },

    /// Push a task's due date back
    Postpone {
        /// Task id
        id: String,

        /// Hours to postpone by
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Delete a task
    Delete {
        /// Task id
        id: String,
    },

    /// Delete every task
    Clear {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Dump pending mutations for debugging
    Pending {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Upload pending mutations
    Sync {
        /// Start in offline mode
        #[arg(long)]
        offline: bool,

        /// Run the scheduler for this many seconds instead of a single pass
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Print open tasks whenever they change
    Watch {
        /// Stop after this many snapshots
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// How often to check for writes from other processes, in milliseconds
        #[arg(long, default_value = "500")]
        poll_ms: u64,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output stays parseable
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(db) = cli.db {
        config.database = db;
    }
    let ctx = Context::new(config);

    match cli.command {
        Commands::Add {
            title,
            description,
            priority,
            due_in_hours,
        } => {
            commands::tasks::add(&ctx, title, description, &priority, due_in_hours)?;
        }
        Commands::List { all, format } => commands::tasks::list(&ctx, all, &format)?,
        Commands::Complete { id } => commands::tasks::complete(&ctx, &id)?,
        Commands::Reopen { id } => commands::tasks::reopen(&ctx, &id)?,
        Commands::Postpone { id, hours } => commands::tasks::postpone(&ctx, &id, hours)?,
        Commands::Delete { id } => commands::tasks::delete(&ctx, &id)?,
        Commands::Clear { yes } => {
            if !yes {
                return Err("refusing to delete every task without --yes".into());
            }
            commands::tasks::clear(&ctx)?;
        }
        Commands::Pending { limit, format } => commands::pending::run(&ctx, limit, &format)?,
        Commands::Sync { offline, duration } => {
            commands::sync::run(&ctx, offline, duration).await?;
        }
        Commands::Watch { count, poll_ms } => {
            commands::watch::run(&ctx, count, poll_ms).await?;
        }
        Commands::Version => {
            println!("TideSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Schema format v{}", tidesync_core::SCHEMA_FORMAT_VERSION);
        }
    }

    Ok(())
}
