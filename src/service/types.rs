use std::sync::atomic::AtomicU64;

use crate::schema::TopicMetadata;

/// How an inbound topic is attributed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicClass {
    /// `<index_prefix>/<INDEX>`
    Index(String),
    /// `<option_topic_prefix><token>`; metadata is absent if the topic was
    /// never subscribed through a window expansion
    Derivative(Option<TopicMetadata>),
    /// Neither family
    Unattributed,
}

/// Coordinator statistics
#[derive(Debug, Default)]
pub struct IngestStats {
    /// Payloads received
    pub messages: AtomicU64,
    /// Payloads no format could decode
    pub decode_failures: AtomicU64,
    /// Readings handed to the batch writer
    pub readings: AtomicU64,
    /// Readings the batch writer rejected
    pub rejected: AtomicU64,
    /// Strike-window expansions started
    pub expansions: AtomicU64,
}
