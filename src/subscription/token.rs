//! Option token lookup
//!
//! Maps `(index, expiry, option type, strike)` to the instrument token whose
//! topic carries that option's price.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::TokenServiceSettings;
use crate::error::{ErrorCategory, ErrorClassification};
use crate::schema::OptionType;

/// One option contract to look up
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenQuery {
    pub index: String,
    pub expiry_date: String,
    pub option_type: OptionType,
    pub strike: Decimal,
}

impl TokenQuery {
    /// Query string parameters in the order the service documents them
    pub fn params(&self) -> [(&'static str, String); 4] {
        [
            ("index", self.index.clone()),
            ("expiryDate", self.expiry_date.clone()),
            ("optionType", self.option_type.as_str().to_string()),
            ("strikePrice", self.strike.normalize().to_string()),
        ]
    }
}

impl std::fmt::Display for TokenQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}{}",
            self.index,
            self.expiry_date,
            self.strike.normalize(),
            self.option_type
        )
    }
}

/// Token lookup errors
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("Service returned status {0}")]
    Status(u16),

    #[error("Response carried no token")]
    MissingToken,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ErrorClassification for LookupError {
    fn category(&self) -> ErrorCategory {
        match self {
            LookupError::Http(_) | LookupError::Timeout(_) => ErrorCategory::Transient,
            LookupError::Status(code) if *code == 429 => ErrorCategory::ResourceExhausted,
            LookupError::Status(code) if *code >= 500 => ErrorCategory::Transient,
            LookupError::Status(_) | LookupError::MissingToken => ErrorCategory::Permanent,
            LookupError::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

pub type LookupResult<T> = Result<T, LookupError>;

/// Source of option instrument tokens
#[async_trait]
pub trait TokenLookup: Send + Sync {
    async fn lookup(&self, query: &TokenQuery) -> LookupResult<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<serde_json::Value>,
}

/// Extract a usable token; numbers are accepted and rendered as text
fn token_from_response(response: TokenResponse) -> LookupResult<String> {
    match response.token {
        Some(serde_json::Value::String(token)) if !token.trim().is_empty() => {
            Ok(token.trim().to_string())
        }
        Some(serde_json::Value::Number(token)) => Ok(token.to_string()),
        _ => Err(LookupError::MissingToken),
    }
}

/// HTTPS client for `GET <base_url>/token`
pub struct HttpTokenClient {
    client: Client,
    base_url: String,
}

impl HttpTokenClient {
    pub fn new(settings: &TokenServiceSettings) -> LookupResult<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| {
                LookupError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TokenLookup for HttpTokenClient {
    async fn lookup(&self, query: &TokenQuery) -> LookupResult<String> {
        let url = format!("{}/token", self.base_url);
        debug!("Looking up token for {}", query);

        let response = self.client.get(&url).query(&query.params()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }

        let body: TokenResponse = response.json().await?;
        token_from_response(body)
    }
}
