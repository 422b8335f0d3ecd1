//! MQTT transport
//!
//! Wraps a `rumqttc` client. The event loop runs in its own task and forwards
//! every PUBLISH to an mpsc channel; after a reconnect it re-issues all
//! subscriptions accepted so far (the session is clean).

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{InboundMessage, Transport, TransportError, TransportResult};
use crate::config::MqttSettings;

/// Pause before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// MQTT-backed [`Transport`]
pub struct MqttTransport {
    client: AsyncClient,
    topics: Arc<RwLock<HashSet<String>>>,
    /// Set once the event loop has exited
    closed: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Create the client and spawn its event loop
    ///
    /// Returns the transport, the receiving end of the inbound channel and the
    /// event loop handle. The loop stops on `shutdown` or when the receiver
    /// is dropped.
    pub fn connect(
        settings: &MqttSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> TransportResult<(Self, mpsc::Receiver<InboundMessage>, JoinHandle<()>)> {
        if settings.host.trim().is_empty() {
            return Err(TransportError::Configuration("MQTT host is empty".into()));
        }
        if settings.port == 0 {
            return Err(TransportError::Configuration("MQTT port must be non-zero".into()));
        }

        let client_id = settings.client_id.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("ltp-ingest-{}", &suffix[..8])
        });

        let mut options = MqttOptions::new(client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            settings.host, settings.port, client_id
        );

        let (client, event_loop) = AsyncClient::new(options, 100);
        let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
        let topics = Arc::new(RwLock::new(HashSet::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let handle = {
            let client = client.clone();
            let topics = Arc::clone(&topics);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                run_event_loop(event_loop, client, topics, tx, shutdown).await;
                closed.store(true, Ordering::Release);
            })
        };

        Ok((
            Self {
                client,
                topics,
                closed,
            },
            rx,
            handle,
        ))
    }

    /// Whether the event loop has stopped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Topics subscribed through this transport
    pub fn subscriptions(&self) -> usize {
        self.topics.read().len()
    }

    /// Send DISCONNECT to the broker
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Subscription(format!("{}: {}", topic, e)))?;

        self.topics.write().insert(topic.to_string());
        debug!("MQTT subscribe sent for {}", topic);
        Ok(())
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    topics: Arc<RwLock<HashSet<String>>>,
    tx: mpsc::Sender<InboundMessage>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut connected_before = false;

    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => {
                info!("MQTT event loop shutting down");
                break;
            }
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    received_at: Utc::now(),
                };
                if tx.send(message).await.is_err() {
                    info!("Inbound channel closed, stopping MQTT event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if connected_before {
                    resubscribe(&client, &topics);
                } else {
                    info!("Connected to MQTT broker");
                }
                connected_before = true;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn resubscribe(client: &AsyncClient, topics: &RwLock<HashSet<String>>) {
    let topics: Vec<String> = topics.read().iter().cloned().collect();
    info!("Reconnected to MQTT broker, restoring {} subscriptions", topics.len());

    // try_subscribe: awaiting here would block the loop that drains the request queue
    for topic in topics {
        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
            warn!("Failed to restore subscription {}: {}", topic, e);
        }
    }
}
