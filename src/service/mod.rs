//! Ingestion coordinator
//!
//! Per inbound payload: decode, classify the topic, feed index prices to the
//! subscription manager and hand every reading to the batch writer.

pub mod errors;
pub mod ingest;
pub mod types;

pub use errors::{ServiceError, ServiceResult};
pub use ingest::IngestionService;
pub use types::*;

#[cfg(test)]
mod ingest_tests;
