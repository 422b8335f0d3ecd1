use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::{IngestStats, ServiceError, ServiceResult, TopicClass};
use crate::decoder::DecoderChain;
use crate::schema::Reading;
use crate::storage::{BatchWriter, DimensionResolver};
use crate::subscription::{ExpansionReport, SubscriptionManager};
use crate::transport::InboundMessage;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Ingestion coordinator tying decoder, subscriptions and batch writer together
pub struct IngestionService {
    decoder: DecoderChain,
    subscriptions: Arc<SubscriptionManager>,
    writer: BatchWriter,
    resolver: Arc<DimensionResolver>,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<IngestStats>,
    /// Window expansions still running
    expansions: Mutex<Vec<JoinHandle<ExpansionReport>>>,
}

impl IngestionService {
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        writer: BatchWriter,
        resolver: Arc<DimensionResolver>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            decoder: DecoderChain::standard(),
            subscriptions,
            writer,
            resolver,
            shutdown_tx,
            stats: Arc::new(IngestStats::default()),
            expansions: Mutex::new(Vec::new()),
        }
    }

    pub fn get_shutdown_tx(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    pub fn writer(&self) -> &BatchWriter {
        &self.writer
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Subscribe the index topics; fails only if none could be subscribed
    pub async fn start(&self) -> ServiceResult<()> {
        let app = self.subscriptions.settings();
        if app.indices.is_empty() {
            return Err(ServiceError::Configuration(
                "No indices configured".to_string(),
            ));
        }

        info!("Starting ingestion for indices: {:?}", app.indices);
        self.subscriptions.subscribe_to_base_instruments().await;

        if self.subscriptions.active_count() == 0 {
            return Err(ServiceError::NoSubscriptions);
        }
        Ok(())
    }

    /// Attribute a topic
    pub fn classify_topic(&self, topic: &str) -> TopicClass {
        let app = self.subscriptions.settings();

        if let Some(index) = topic
            .strip_prefix(app.index_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            if !index.is_empty() && !index.contains('/') {
                return TopicClass::Index(index.to_string());
            }
        }

        if topic.starts_with(app.option_topic_prefix.as_str()) {
            return TopicClass::Derivative(self.subscriptions.metadata(topic));
        }

        TopicClass::Unattributed
    }

    /// Process one inbound payload; returns the number of readings buffered
    ///
    /// Decoding and buffering happen inline so readings of one topic keep
    /// their arrival order. Only the strike-window expansion is spawned.
    pub fn handle_message(&self, message: &InboundMessage) -> usize {
        self.stats.messages.fetch_add(1, Ordering::Relaxed);

        let prices = self.decoder.decode(&message.topic, &message.payload);
        if prices.is_empty() {
            self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Could not decode payload on {} ({} bytes)",
                message.topic,
                message.payload.len()
            );
            return 0;
        }

        let class = self.classify_topic(&message.topic);
        if let TopicClass::Derivative(None) = class {
            debug!("No metadata for derivative topic {}", message.topic);
        }

        let mut buffered = 0;
        for price in prices {
            let mut reading = Reading::new(message.topic.clone(), price, message.received_at);

            match &class {
                TopicClass::Index(index) => {
                    reading = reading.with_index(index.clone());
                    if let Some(atm) = self.subscriptions.observe_index_price(index, price) {
                        self.spawn_expansion(index.clone(), atm);
                    }
                }
                TopicClass::Derivative(Some(metadata)) => {
                    reading = reading.with_metadata(metadata);
                }
                TopicClass::Derivative(None) | TopicClass::Unattributed => {}
            }

            debug!("{} ltp {}", message.topic, price);
            match self.writer.append(reading) {
                Ok(_) => {
                    self.stats.readings.fetch_add(1, Ordering::Relaxed);
                    buffered += 1;
                }
                Err(e) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping reading: {}", e);
                }
            }
        }

        buffered
    }

    fn spawn_expansion(&self, index: String, atm: rust_decimal::Decimal) {
        self.stats.expansions.fetch_add(1, Ordering::Relaxed);
        let subscriptions = Arc::clone(&self.subscriptions);
        let handle =
            tokio::spawn(async move { subscriptions.expand_window(&index, atm).await });

        let mut expansions = self.expansions.lock();
        expansions.retain(|h| !h.is_finished());
        expansions.push(handle);
    }

    /// Wait for every window expansion started so far
    pub async fn wait_for_expansions(&self) -> Vec<ExpansionReport> {
        let handles: Vec<_> = std::mem::take(&mut *self.expansions.lock());
        let mut reports = Vec::with_capacity(handles.len());

        for handle in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Window expansion task failed: {}", e),
            }
        }
        reports
    }

    /// Consume inbound messages until shutdown or channel close, then flush
    pub async fn run(&self, mut inbound: mpsc::Receiver<InboundMessage>) -> ServiceResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut health_monitor = interval(HEALTH_INTERVAL);
        let mut last_message_count = 0u64;

        loop {
            select! {
                message = inbound.recv() => {
                    match message {
                        Some(message) => {
                            self.handle_message(&message);
                        }
                        None => {
                            warn!("Inbound channel closed");
                            break;
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested, flushing remaining readings");
                    break;
                }

                _ = health_monitor.tick() => {
                    let messages = self.stats.messages.load(Ordering::Relaxed);
                    self.log_health(messages - last_message_count);
                    last_message_count = messages;
                }
            }
        }

        let report = self.writer.close().await;
        info!(
            "Ingestion stopped: final flush persisted {} readings ({} lost, {} unresolved)",
            report.persisted, report.lost, report.unresolved
        );
        Ok(())
    }

    fn log_health(&self, messages_since_last: u64) {
        let batch = self.writer.stats();
        info!(
            "Pipeline Health: {} msgs/30s | Total: {} | Undecodable: {} | Readings: {} | Buffered: {} | Batches: {} | Failed: {} | Lost: {} | Dimensions: {} ({:.1}% cached) | Subscriptions: {}",
            messages_since_last,
            self.stats.messages.load(Ordering::Relaxed),
            self.stats.decode_failures.load(Ordering::Relaxed),
            self.stats.readings.load(Ordering::Relaxed),
            self.writer.pending(),
            batch.flushed_batches.load(Ordering::Relaxed),
            batch.failed_batches.load(Ordering::Relaxed),
            batch.lost_rows.load(Ordering::Relaxed),
            self.resolver.cache_size(),
            self.resolver.stats().hit_ratio() * 100.0,
            self.subscriptions.active_count()
        );
    }
}
