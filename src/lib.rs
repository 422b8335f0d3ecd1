//! LTP ingestion
//!
//! Subscribes to index price topics over MQTT, expands the subscription set to
//! the option strike window around each index's first observed price, and
//! persists every decoded last-traded price into Postgres in batches.

pub mod cli;
pub mod config;
pub mod decoder;
pub mod error;
pub mod schema;
pub mod service;
pub mod storage;
pub mod subscription;
pub mod transport;
