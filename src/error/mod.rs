//! Error classification shared by every layer of the ingestion pipeline.
//!
//! Each layer defines its own `thiserror` enum (repository, token lookup,
//! transport, batch writer) and implements [`ErrorClassification`] so the
//! callers can decide between dropping, retrying or aborting uniformly.

mod traits;

pub use traits::*;
