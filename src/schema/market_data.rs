//! Normalized reading and dimension types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option instrument type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    /// Call (`ce`)
    Call,
    /// Put (`pe`)
    Put,
}

impl OptionType {
    pub const ALL: [OptionType; 2] = [OptionType::Call, OptionType::Put];

    /// Representation used by the token service and the `topics.option_type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "ce",
            OptionType::Put => "pe",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ce" | "call" => Some(OptionType::Call),
            "pe" | "put" => Some(OptionType::Put),
            _ => None,
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attribution of a derivative topic, recorded when the topic is subscribed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicMetadata {
    pub index: String,
    pub option_type: OptionType,
    pub strike: Decimal,
}

/// Composite key identifying one row of the dimension table
///
/// Absent fields are a distinct value, not a wildcard: `(NIFTY, None, None)`
/// and `(NIFTY, Some(Call), None)` are different keys. The topic is part of
/// the key so unattributed topics keep separate rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimensionKey {
    pub topic: String,
    pub index: Option<String>,
    pub option_type: Option<OptionType>,
    pub strike: Option<Decimal>,
}

impl DimensionKey {
    pub fn new(
        topic: impl Into<String>,
        index: Option<String>,
        option_type: Option<OptionType>,
        strike: Option<Decimal>,
    ) -> Self {
        Self {
            topic: topic.into(),
            index,
            option_type,
            // 19950 and 19950.00 must hash alike
            strike: strike.map(|s| s.normalize()),
        }
    }
}

impl std::fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.topic,
            self.index.as_deref().unwrap_or(""),
            self.option_type.map(|t| t.as_str()).unwrap_or(""),
            self.strike.map(|s| s.to_string()).unwrap_or_default()
        )
    }
}

/// A single decoded price observation
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Topic the payload arrived on
    pub topic: String,
    /// Observed price
    pub value: Decimal,
    pub index: Option<String>,
    pub option_type: Option<OptionType>,
    pub strike: Option<Decimal>,
    /// Receipt time of the payload
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    /// Reading with no attribution (index or unknown topic)
    pub fn new(topic: impl Into<String>, value: Decimal, observed_at: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            value,
            index: None,
            option_type: None,
            strike: None,
            observed_at,
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn with_metadata(mut self, metadata: &TopicMetadata) -> Self {
        self.index = Some(metadata.index.clone());
        self.option_type = Some(metadata.option_type);
        self.strike = Some(metadata.strike);
        self
    }

    pub fn dimension_key(&self) -> DimensionKey {
        DimensionKey::new(
            self.topic.clone(),
            self.index.clone(),
            self.option_type,
            self.strike,
        )
    }
}

/// A reading resolved against the dimension table, ready for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingRow {
    pub dimension_id: i64,
    pub value: Decimal,
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    #[test]
    fn test_option_type_conversion() {
        assert_eq!(OptionType::Call.as_str(), "ce");
        assert_eq!(OptionType::from_str("PE"), Some(OptionType::Put));
        assert_eq!(OptionType::from_str("fut"), None);
    }

    #[test]
    fn test_dimension_key_treats_none_as_value() {
        let index_only = DimensionKey::new("index/NIFTY", Some("NIFTY".into()), None, None);
        let with_type = DimensionKey::new(
            "index/NIFTY",
            Some("NIFTY".into()),
            Some(OptionType::Call),
            None,
        );
        assert_ne!(index_only, with_type);
        assert_eq!(index_only.to_string(), "index/NIFTY|NIFTY||");
    }

    #[test]
    fn test_dimension_key_normalizes_strike() {
        let a = DimensionKey::new("t", None, Some(OptionType::Put), Some(dec!(19950)));
        let b = DimensionKey::new("t", None, Some(OptionType::Put), Some(dec!(19950.00)));
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_reading_key_from_metadata() {
        let metadata = TopicMetadata {
            index: "NIFTY".into(),
            option_type: OptionType::Call,
            strike: dec!(20000),
        };
        let reading = Reading::new("NSE_FO|1234", dec!(101.5), Utc::now()).with_metadata(&metadata);
        let key = reading.dimension_key();
        assert_eq!(key.index.as_deref(), Some("NIFTY"));
        assert_eq!(key.option_type, Some(OptionType::Call));
        assert_eq!(key.strike, Some(dec!(20000)));
    }
}
