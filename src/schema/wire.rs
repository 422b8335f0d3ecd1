//! Protobuf wire messages
//!
//! Hand-maintained prost definitions equivalent to:
//!
//! ```text
//! message MarketData      { optional double ltp = 1; }
//! message MarketDataBatch { repeated MarketData data = 1; }
//! ```
//!
//! Producers may add further fields; prost skips unknown tags.

/// Single price record
#[derive(Clone, PartialEq, prost::Message)]
pub struct MarketData {
    /// Last traded price
    #[prost(double, optional, tag = "1")]
    pub ltp: Option<f64>,
}

/// Batch of price records
#[derive(Clone, PartialEq, prost::Message)]
pub struct MarketDataBatch {
    #[prost(message, repeated, tag = "1")]
    pub data: Vec<MarketData>,
}

impl MarketData {
    pub fn with_ltp(ltp: f64) -> Self {
        Self { ltp: Some(ltp) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_single_and_batch_are_wire_incompatible() {
        let single = MarketData::with_ltp(19962.5).encode_to_vec();
        let batch = MarketDataBatch {
            data: vec![MarketData::with_ltp(1.0), MarketData::with_ltp(2.0)],
        }
        .encode_to_vec();

        // field 1 is fixed64 in one schema and length-delimited in the other
        assert!(MarketDataBatch::decode(single.as_slice()).is_err());
        assert!(MarketData::decode(batch.as_slice()).is_err());
    }

    #[test]
    fn test_missing_ltp_decodes_as_none() {
        let decoded = MarketData::decode(&[][..]).unwrap();
        assert_eq!(decoded.ltp, None);
    }
}
