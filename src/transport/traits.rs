//! Transport trait definitions

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::{ErrorCategory, ErrorClassification};

/// Transport error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Transport closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ErrorClassification for TransportError {
    fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Connection(_) => ErrorCategory::Transient,
            TransportError::Subscription(_) => ErrorCategory::Transient,
            TransportError::InvalidTopic(_) => ErrorCategory::Permanent,
            TransportError::Closed => ErrorCategory::Internal,
            TransportError::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A payload delivered on a topic
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// When the payload was taken off the wire
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Subscribe side of a pub/sub transport
///
/// Messages are delivered out of band (see `MqttTransport::connect`).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start receiving messages published on `topic`
    async fn subscribe(&self, topic: &str) -> TransportResult<()>;
}
