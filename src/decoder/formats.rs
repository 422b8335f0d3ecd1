//! Individual payload formats

use prost::Message;
use rust_decimal::Decimal;

use crate::schema::{MarketData, MarketDataBatch};

/// Outcome of one decode attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeAttempt {
    /// The payload is in this format and carried these prices
    Decoded(Vec<Decimal>),
    /// Not this format (or no usable price); try the next one
    Next(String),
}

/// A single wire format that may or may not match a payload
pub trait PayloadDecoder: Send + Sync {
    /// Short format name for logs
    fn name(&self) -> &'static str;

    /// Attempt to extract prices from the payload
    fn decode(&self, payload: &[u8]) -> DecodeAttempt;
}

/// Convert a wire price into a decimal, rejecting NaN and infinities
pub fn price_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::try_from(value).ok()
}

/// `MarketData` protobuf with a single `ltp`
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRecordDecoder;

impl PayloadDecoder for SingleRecordDecoder {
    fn name(&self) -> &'static str {
        "protobuf-single"
    }

    fn decode(&self, payload: &[u8]) -> DecodeAttempt {
        match MarketData::decode(payload) {
            Ok(record) => match record.ltp.and_then(price_from_f64) {
                Some(price) => DecodeAttempt::Decoded(vec![price]),
                None => DecodeAttempt::Next("no usable ltp field".to_string()),
            },
            Err(e) => DecodeAttempt::Next(e.to_string()),
        }
    }
}

/// `MarketDataBatch` protobuf with repeated records
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchDecoder;

impl PayloadDecoder for BatchDecoder {
    fn name(&self) -> &'static str {
        "protobuf-batch"
    }

    fn decode(&self, payload: &[u8]) -> DecodeAttempt {
        match MarketDataBatch::decode(payload) {
            Ok(batch) => {
                let prices: Vec<Decimal> = batch
                    .data
                    .iter()
                    .filter_map(|record| record.ltp.and_then(price_from_f64))
                    .collect();

                if prices.is_empty() {
                    DecodeAttempt::Next("batch carried no usable ltp".to_string())
                } else {
                    DecodeAttempt::Decoded(prices)
                }
            }
            Err(e) => DecodeAttempt::Next(e.to_string()),
        }
    }
}

/// UTF-8 JSON object with a numeric `ltp`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl PayloadDecoder for JsonDecoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, payload: &[u8]) -> DecodeAttempt {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => return DecodeAttempt::Next(e.to_string()),
        };
        let Some(object) = value.as_object() else {
            return DecodeAttempt::Next("not a JSON object".to_string());
        };

        // Only JSON numbers count; "123.4" as a string does not
        match object
            .get("ltp")
            .and_then(serde_json::Value::as_f64)
            .and_then(price_from_f64)
        {
            Some(price) => DecodeAttempt::Decoded(vec![price]),
            None => DecodeAttempt::Next("no numeric ltp field".to_string()),
        }
    }
}
