//! Database management commands

use anyhow::Result;
use clap::{Args, Subcommand};
use tracing::info;

use crate::config::Settings;
use crate::storage::{LtpRepository, Migrations};

/// Database subcommands
#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
    /// Show database statistics
    Stats(StatsArgs),
}

/// Arguments for stats command
#[derive(Args)]
pub struct StatsArgs {
    /// Also print the latest value of every dimension of this index
    #[arg(long)]
    pub index: Option<String>,
}

/// Execute database commands
pub async fn execute(cmd: DbCommands, settings: Settings) -> Result<()> {
    match cmd {
        DbCommands::Migrate => execute_migrate(settings).await,
        DbCommands::Stats(args) => execute_stats(args, settings).await,
    }
}

async fn execute_migrate(settings: Settings) -> Result<()> {
    let repository = LtpRepository::from_settings(&settings.database).await?;
    let migrations = Migrations::new(repository.pool().clone(), settings.batch.value_precision);

    migrations.run().await?;
    repository.close().await;
    Ok(())
}

async fn execute_stats(args: StatsArgs, settings: Settings) -> Result<()> {
    let repository = LtpRepository::from_settings(&settings.database).await?;

    info!("Fetching database statistics...");
    let stats = repository.get_database_stats().await?;

    info!("Database Statistics:");
    info!("  Dimensions: {}", stats.total_dimensions);
    info!("  Readings: {}", stats.total_readings);
    if let Some(earliest) = stats.earliest_time {
        info!("  Earliest reading: {}", earliest);
    }
    if let Some(latest) = stats.latest_time {
        info!("  Latest reading: {}", latest);
    }

    if let Some(index) = args.index {
        info!("Latest values for {}:", index);
        for latest in repository.get_latest_by_index(&index).await? {
            info!(
                "  {} {}{}: {} at {}",
                latest.topic,
                latest.strike.map(|s| s.normalize().to_string()).unwrap_or_default(),
                latest.option_type.map(|t| t.as_str()).unwrap_or(""),
                latest.value,
                latest.observed_at
            );
        }
    }

    repository.close().await;
    Ok(())
}
