//! Pub/sub transport
//!
//! The ingestion core only needs to subscribe to topics and receive
//! [`InboundMessage`]s; the MQTT client lives behind [`Transport`].

mod mqtt;
mod traits;

pub use mqtt::*;
pub use traits::*;
