//! Common data types
//!
//! Wire messages published by the upstream producers and the normalized types
//! that flow from the decoder through the batch writer into storage.

mod market_data;
mod wire;

pub use market_data::*;
pub use wire::*;
