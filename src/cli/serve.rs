//! Serve command - start the ingestion service

use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::service::IngestionService;
use crate::storage::memory::MemoryStore;
use crate::storage::{
    BatchWriter, DimensionResolver, DimensionStore, LtpRepository, Migrations, ReadingSink,
};
use crate::subscription::{HttpTokenClient, SubscriptionManager};
use crate::transport::MqttTransport;

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Keep dimensions and readings in memory instead of Postgres
    #[arg(long)]
    pub dry_run: bool,

    /// Run database migrations before starting
    #[arg(long)]
    pub migrate: bool,
}

/// Execute the serve command
pub async fn execute(args: ServeArgs, settings: Settings) -> Result<()> {
    settings.validate()?;

    info!("Starting LTP ingestion service");
    info!("  Broker: {}:{}", settings.mqtt.host, settings.mqtt.port);
    info!("  Indices: {:?}", settings.app.indices);
    info!("  Strike window: ±{}", settings.app.strike_range);
    info!(
        "  Batch: {} readings / {} ms",
        settings.batch.size, settings.batch.interval_ms
    );
    info!("  Dry run: {}", args.dry_run);

    let (dimensions, sink, repository): (
        Arc<dyn DimensionStore>,
        Arc<dyn ReadingSink>,
        Option<LtpRepository>,
    ) = if args.dry_run {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), store, None)
    } else {
        info!("Connecting to database...");
        let repository = LtpRepository::from_settings(&settings.database).await?;
        if args.migrate {
            Migrations::new(repository.pool().clone(), settings.batch.value_precision)
                .run()
                .await?;
        }
        let shared = Arc::new(repository.clone());
        (shared.clone(), shared, Some(repository))
    };

    let resolver = Arc::new(DimensionResolver::new(dimensions));
    if let Err(e) = resolver.preload().await {
        warn!("Dimension preload failed, starting with an empty cache: {}", e);
    }

    let writer = BatchWriter::new(Arc::clone(&resolver), sink, &settings.batch);

    let (transport_shutdown, _) = broadcast::channel::<()>(1);
    let (transport, inbound, event_loop) =
        MqttTransport::connect(&settings.mqtt, transport_shutdown.subscribe())?;
    let transport = Arc::new(transport);

    let tokens = Arc::new(HttpTokenClient::new(&settings.token_service)?);
    let subscriptions = Arc::new(SubscriptionManager::new(
        settings.app.clone(),
        settings.token_service.timeout(),
        transport.clone(),
        tokens,
    ));

    let service = IngestionService::new(subscriptions, writer, resolver);
    service.start().await?;

    // Handle Ctrl+C
    let shutdown_tx = service.get_shutdown_tx();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                let _ = shutdown_tx.send(());
            }
            Err(e) => error!("Failed to listen for ctrl+c: {}", e),
        }
    });

    info!("Ingestion service started");
    info!("Press Ctrl+C to stop");

    service.run(inbound).await?;

    info!("Shutting down...");
    transport.disconnect().await;
    let _ = transport_shutdown.send(());
    if let Err(e) = event_loop.await {
        warn!("MQTT event loop ended abnormally: {}", e);
    }

    if let Some(repository) = repository {
        repository.close().await;
    }

    info!("LTP ingestion service stopped");
    Ok(())
}
