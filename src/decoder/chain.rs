//! Ordered decoder chain

use rust_decimal::Decimal;
use tracing::debug;

use super::{BatchDecoder, DecodeAttempt, JsonDecoder, PayloadDecoder, SingleRecordDecoder};

/// Prices extracted from one payload and the format that produced them
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub format: &'static str,
    pub prices: Vec<Decimal>,
}

/// Ordered list of formats, first match wins
pub struct DecoderChain {
    decoders: Vec<Box<dyn PayloadDecoder>>,
}

impl DecoderChain {
    /// Build a chain from explicit decoders, tried in the given order
    pub fn new(decoders: Vec<Box<dyn PayloadDecoder>>) -> Self {
        Self { decoders }
    }

    /// Single-record protobuf, then batch protobuf, then JSON
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(SingleRecordDecoder),
            Box::new(BatchDecoder),
            Box::new(JsonDecoder),
        ])
    }

    /// Try every format in order and report which one matched
    ///
    /// Returns `None` when no format produced a usable price.
    pub fn decode_with_format(&self, topic: &str, payload: &[u8]) -> Option<Decoded> {
        for decoder in &self.decoders {
            match decoder.decode(payload) {
                DecodeAttempt::Decoded(prices) => {
                    return Some(Decoded {
                        format: decoder.name(),
                        prices,
                    });
                }
                DecodeAttempt::Next(reason) => {
                    debug!("{}: not {} ({})", topic, decoder.name(), reason);
                }
            }
        }
        None
    }

    /// Extract prices from a payload; never fails, an unknown payload yields nothing
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Vec<Decimal> {
        self.decode_with_format(topic, payload)
            .map(|decoded| decoded.prices)
            .unwrap_or_default()
    }
}

impl Default for DecoderChain {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MarketData, MarketDataBatch};
    use prost::Message;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        name: &'static str,
        result: Option<Decimal>,
        calls: Arc<AtomicUsize>,
    }

    impl PayloadDecoder for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn decode(&self, _payload: &[u8]) -> DecodeAttempt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.result {
                Some(price) => DecodeAttempt::Decoded(vec![price]),
                None => DecodeAttempt::Next("no".into()),
            }
        }
    }

    #[test]
    fn test_stops_at_first_success() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let chain = DecoderChain::new(vec![
            Box::new(Fixed {
                name: "miss",
                result: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(Fixed {
                name: "hit",
                result: Some(dec!(1)),
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(Fixed {
                name: "later",
                result: Some(dec!(2)),
                calls: Arc::clone(&later_calls),
            }),
        ]);

        let decoded = chain.decode_with_format("t", b"x").unwrap();
        assert_eq!(decoded.format, "hit");
        assert_eq!(decoded.prices, vec![dec!(1)]);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_standard_chain_formats() {
        let chain = DecoderChain::standard();

        let single = MarketData::with_ltp(22150.5).encode_to_vec();
        let decoded = chain.decode_with_format("index/NIFTY", &single).unwrap();
        assert_eq!(decoded.format, "protobuf-single");
        assert_eq!(decoded.prices, vec![dec!(22150.5)]);

        let batch = MarketDataBatch {
            data: vec![MarketData::with_ltp(10.5), MarketData::with_ltp(11.0)],
        }
        .encode_to_vec();
        let decoded = chain.decode_with_format("NSE_FO|1", &batch).unwrap();
        assert_eq!(decoded.format, "protobuf-batch");
        assert_eq!(decoded.prices, vec![dec!(10.5), dec!(11)]);

        let decoded = chain
            .decode_with_format("NSE_FO|1", br#"{"ltp": 87.25}"#)
            .unwrap();
        assert_eq!(decoded.format, "json");
        assert_eq!(decoded.prices, vec![dec!(87.25)]);
    }

    #[test]
    fn test_unknown_payload_yields_nothing() {
        let chain = DecoderChain::standard();
        assert!(chain.decode("index/NIFTY", b"\xff\xff garbage").is_empty());
        assert!(chain.decode("index/NIFTY", b"").is_empty());
        assert!(chain.decode("index/NIFTY", br#"{"price": 1}"#).is_empty());
        assert!(chain.decode("NSE_FO|1", b"[87.5]").is_empty());
    }

    #[test]
    fn test_single_record_preferred_over_json() {
        // TAB is both the protobuf tag of field 1 (fixed64) and JSON whitespace.
        // The next 8 bytes are the double; 0x22 0x2c is an unknown field 4 of
        // length 44 covering the rest of the JSON text.
        let double_bytes: [u8; 8] = *b"{\"k\":\"l@";
        let mut payload = vec![b'\t'];
        payload.extend_from_slice(&double_bytes);
        payload.extend_from_slice(b"\",");
        let tail = format!("{:<44}", "\"ltp\":1}");
        payload.extend_from_slice(tail.as_bytes());

        let as_json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(as_json["ltp"], 1);
        let as_proto = MarketData::decode(payload.as_slice()).unwrap();
        let proto_ltp = as_proto.ltp.unwrap();
        assert_eq!(proto_ltp, f64::from_le_bytes(double_bytes));

        let decoded = DecoderChain::standard()
            .decode_with_format("index/NIFTY", &payload)
            .unwrap();
        assert_eq!(decoded.format, "protobuf-single");
        assert_eq!(decoded.prices.len(), 1);
        assert!(decoded.prices[0] > dec!(128) && decoded.prices[0] < dec!(256));
    }
}
