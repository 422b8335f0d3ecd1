//! Command-line interface
//!
//! - `serve`: run the ingestion service
//! - `db`: schema migrations and statistics

pub mod db;
pub mod serve;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Settings;

/// LTP ingestion CLI
#[derive(Parser)]
#[command(name = "ltp-ingest")]
#[command(about = "Index and option LTP ingestion from MQTT into Postgres")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to config/{default,RUN_MODE,local} + environment)
    #[arg(long, short, global = true)]
    pub config: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the ingestion service
    Serve(serve::ServeArgs),
    /// Database operations
    #[command(subcommand)]
    Db(db::DbCommands),
}

/// Load settings from an explicit file or the layered default sources
pub fn load_settings(config: Option<&str>) -> Result<Settings> {
    let settings = match config {
        Some(path) => Settings::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => Settings::load().context("Failed to load configuration")?,
    };
    Ok(settings)
}
