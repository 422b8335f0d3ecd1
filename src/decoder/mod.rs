//! Payload decoding
//!
//! Upstream producers publish the same price in different encodings and the
//! topic does not say which one. [`DecoderChain`] tries each known format in
//! order and keeps the first one that yields at least one usable price.

mod chain;
mod formats;

pub use chain::*;
pub use formats::*;
