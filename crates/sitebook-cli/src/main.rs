//! Sitebook CLI
//!
//! Usage:
//!   sitebook init                   Initialize database and capabilities
//!   sitebook serve --port 3000      Start the API server
//!   sitebook autoauth --project ID  Run the authorization engine
//!   sitebook train                  Retrain the categorization classifier
//!   sitebook status                 Show pipeline counters

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    if let Some(db) = &cli.db {
        std::env::set_var("SITEBOOK_DB_PATH", db);
    }

    match cli.command {
        Commands::Init => commands::cmd_init(),
        Commands::Serve { port, host } => commands::cmd_serve(&host, port).await,
        Commands::AddUser {
            email,
            name,
            role,
            password,
        } => commands::cmd_add_user(&email, &name, &role, &password),
        Commands::Autoauth { project, digest } => commands::cmd_autoauth(&project, digest).await,
        Commands::Train => commands::cmd_train(),
        Commands::Sweep => commands::cmd_sweep(),
        Commands::Status => commands::cmd_status(),
    }
}
