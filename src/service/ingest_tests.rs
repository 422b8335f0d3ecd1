// ingest_tests.rs - Tests for IngestionService

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{IngestionService, ServiceError, TopicClass};
use crate::config::{BatchSettings, Settings};
use crate::schema::{MarketData, OptionType};
use crate::storage::memory::MemoryStore;
use crate::storage::{BatchWriter, DimensionResolver};
use crate::subscription::{LookupResult, SubscriptionManager, TokenLookup, TokenQuery};
use crate::transport::{InboundMessage, Transport, TransportError, TransportResult};

// ============================================================================
// Mocks
// ============================================================================

#[derive(Default)]
struct MockTransport {
    subscribed: Mutex<Vec<String>>,
    fail_all: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        if self.fail_all {
            return Err(TransportError::Connection("broker down".into()));
        }
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }
}

struct MockTokens;

#[async_trait]
impl TokenLookup for MockTokens {
    async fn lookup(&self, query: &TokenQuery) -> LookupResult<String> {
        Ok(format!("{}{}", query.strike, query.option_type))
    }
}

fn build(transport: Arc<MockTransport>, batch: BatchSettings) -> (IngestionService, Arc<MemoryStore>) {
    let mut settings = Settings::default_settings();
    settings.app.indices = vec!["NIFTY".into()];
    settings.app.strike_range = 1;
    settings.app.expiry_dates = HashMap::from([("NIFTY".to_string(), "2025-05-29".to_string())]);

    let store = Arc::new(MemoryStore::new());
    let resolver = Arc::new(DimensionResolver::new(store.clone()));
    let writer = BatchWriter::new(resolver.clone(), store.clone(), &batch);
    let subscriptions = Arc::new(SubscriptionManager::new(
        settings.app,
        Duration::from_secs(1),
        transport,
        Arc::new(MockTokens),
    ));

    (IngestionService::new(subscriptions, writer, resolver), store)
}

fn proto(ltp: f64) -> Vec<u8> {
    MarketData::with_ltp(ltp).encode_to_vec()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_classify_topic() {
    let (service, _) = build(Arc::new(MockTransport::default()), BatchSettings::default());

    assert_eq!(
        service.classify_topic("index/NIFTY"),
        TopicClass::Index("NIFTY".into())
    );
    assert_eq!(service.classify_topic("NSE_FO|999"), TopicClass::Derivative(None));
    assert_eq!(service.classify_topic("indexNIFTY"), TopicClass::Unattributed);
    assert_eq!(service.classify_topic("index/"), TopicClass::Unattributed);
    assert_eq!(service.classify_topic("other/topic"), TopicClass::Unattributed);
}

#[tokio::test]
async fn test_start_fails_without_any_subscription() {
    let transport = Arc::new(MockTransport {
        fail_all: true,
        ..MockTransport::default()
    });
    let (service, _) = build(transport, BatchSettings::default());

    assert!(matches!(service.start().await, Err(ServiceError::NoSubscriptions)));
}

#[tokio::test]
async fn test_first_index_price_expands_and_attributes_options() {
    let transport = Arc::new(MockTransport::default());
    let (service, store) = build(transport.clone(), BatchSettings::default());
    service.start().await.unwrap();

    assert_eq!(service.handle_message(&InboundMessage::new("index/NIFTY", proto(19962.0))), 1);
    let reports = service.wait_for_expansions().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].subscribed, 6);

    // W=1 around 19950: 19900, 19950, 20000 x ce/pe, plus the index topic
    assert_eq!(transport.subscribed.lock().len(), 7);

    service.handle_message(&InboundMessage::new("NSE_FO|20000pe", br#"{"ltp": 81.5}"#.to_vec()));
    service.handle_message(&InboundMessage::new("index/NIFTY", proto(19990.0)));
    assert!(service.wait_for_expansions().await.is_empty());

    let report = service.writer().flush().await;
    assert_eq!(report.persisted, 3);
    assert_eq!(store.dimension_count(), 2);

    let option_key = crate::schema::DimensionKey::new(
        "NSE_FO|20000pe",
        Some("NIFTY".into()),
        Some(OptionType::Put),
        Some(dec!(20000)),
    );
    let option_id = store.dimension_id(&option_key).unwrap();
    let rows = store.readings();
    let option_row = rows.iter().find(|r| r.dimension_id == option_id).unwrap();
    assert_eq!(option_row.value, dec!(81.50));
}

#[tokio::test]
async fn test_undecodable_payload_counted_not_buffered() {
    let (service, _) = build(Arc::new(MockTransport::default()), BatchSettings::default());

    assert_eq!(service.handle_message(&InboundMessage::new("index/NIFTY", b"\xff\xfe".to_vec())), 0);
    assert_eq!(service.stats().decode_failures.load(Ordering::Relaxed), 1);
    assert_eq!(service.writer().pending(), 0);
}

#[tokio::test]
async fn test_overflow_counted_as_rejected() {
    let (service, _) = build(Arc::new(MockTransport::default()), BatchSettings::default());

    assert_eq!(service.handle_message(&InboundMessage::new("x/y", proto(1e9))), 0);
    assert_eq!(service.stats().rejected.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_run_flushes_on_channel_close() {
    let (service, store) = build(Arc::new(MockTransport::default()), BatchSettings::default());
    let (tx, rx) = mpsc::channel(8);

    tx.send(InboundMessage::new("NSE_FO|1", proto(10.0))).await.unwrap();
    tx.send(InboundMessage::new("NSE_FO|1", proto(11.0))).await.unwrap();
    drop(tx);

    service.run(rx).await.unwrap();

    let values: Vec<_> = store.readings().iter().map(|r| r.value).collect();
    assert_eq!(values, vec![dec!(10), dec!(11)]);
}

#[tokio::test]
async fn test_run_flushes_on_shutdown() {
    let (service, store) = build(Arc::new(MockTransport::default()), BatchSettings::default());
    let service = Arc::new(service);
    let (tx, rx) = mpsc::channel(8);

    let runner = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run(rx).await })
    };

    tx.send(InboundMessage::new("NSE_FO|1", proto(10.0))).await.unwrap();
    while service.stats().messages.load(Ordering::Relaxed) == 0 {
        tokio::task::yield_now().await;
    }
    service.get_shutdown_tx().send(()).unwrap();

    runner.await.unwrap().unwrap();
    assert_eq!(store.readings().len(), 1);
    drop(tx);
}
