//! CLI argument definitions using clap
//!
//! Command implementations live in the `commands` module.

use clap::{Parser, Subcommand};

/// Sitebook - construction expense backend
#[derive(Parser)]
#[command(name = "sitebook")]
#[command(about = "Expense ingestion and auto-authorization backend", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path (overrides SITEBOOK_DB_PATH)
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database and seed role capabilities
    Init,

    /// Start the web server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Create a user
    AddUser {
        #[arg(long)]
        email: String,

        #[arg(long)]
        name: String,

        /// admin | bookkeeper | project_manager | accounting_manager
        #[arg(long, default_value = "bookkeeper")]
        role: String,

        /// Password (prompted use discouraged; pass via env in scripts)
        #[arg(long)]
        password: String,
    },

    /// Run the auto-authorization engine for a project
    Autoauth {
        /// Project id
        #[arg(long)]
        project: String,

        /// Also flush the chat digest after the run
        #[arg(long)]
        digest: bool,
    },

    /// Train the ML classifier now
    Train,

    /// Sweep expired categorization cache entries
    Sweep,

    /// Show pipeline status counters
    Status,
}
