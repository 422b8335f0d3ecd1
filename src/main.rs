//! LTP ingestion CLI
//!
//! Provides commands for:
//! - `serve`: Subscribe to index prices, expand to option strikes and persist LTPs
//! - `db`: Database operations

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ltp_ingest::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ltp_ingest=info".parse()?))
        .init();

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();
    let settings = cli::load_settings(cli.config.as_deref())?;

    // Execute command
    match cli.command {
        Commands::Serve(args) => {
            cli::serve::execute(args, settings).await?;
        }
        Commands::Db(cmd) => {
            cli::db::execute(cmd, settings).await?;
        }
    }

    Ok(())
}
