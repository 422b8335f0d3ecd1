//! Subscription manager
//!
//! Owns the active topic set and the attribution of derivative topics. The
//! first price seen on each index fixes the at-the-money strike and expands
//! the subscription set to the strike window around it, calls and puts.

use futures_util::future::join_all;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{atm_strike, strike_window, LookupError, LookupResult, TokenLookup, TokenQuery};
use crate::config::AppSettings;
use crate::schema::{OptionType, TopicMetadata};
use crate::transport::{Transport, TransportResult};

#[derive(Debug, Default)]
struct SubscriptionState {
    active_topics: HashSet<String>,
    metadata: HashMap<String, TopicMetadata>,
    last_atm: HashMap<String, Decimal>,
    last_price: HashMap<String, Decimal>,
}

/// Result of one strike-window expansion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpansionReport {
    pub index: String,
    pub atm: Decimal,
    /// (strike, type) legs attempted
    pub attempted: usize,
    pub subscribed: usize,
    pub already_active: usize,
    pub lookup_failures: usize,
    pub subscribe_failures: usize,
}

enum LegOutcome {
    Subscribed,
    AlreadyActive,
    LookupFailed,
    SubscribeFailed,
}

/// Subscription manager
pub struct SubscriptionManager {
    app: AppSettings,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenLookup>,
    lookup_timeout: Duration,
    state: RwLock<SubscriptionState>,
    /// Per index: still waiting for its first price
    awaiting_first: HashMap<String, AtomicBool>,
}

impl SubscriptionManager {
    pub fn new(
        app: AppSettings,
        lookup_timeout: Duration,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenLookup>,
    ) -> Self {
        let awaiting_first = app
            .indices
            .iter()
            .map(|index| (index.clone(), AtomicBool::new(true)))
            .collect();

        Self {
            app,
            transport,
            tokens,
            lookup_timeout,
            state: RwLock::new(SubscriptionState::default()),
            awaiting_first,
        }
    }

    pub fn settings(&self) -> &AppSettings {
        &self.app
    }

    /// Subscribe every configured index topic; repeat calls are no-ops
    ///
    /// Returns the number of topics newly subscribed.
    pub async fn subscribe_to_base_instruments(&self) -> usize {
        let mut subscribed = 0;

        for index in &self.app.indices {
            let topic = self.app.index_topic(index);
            match self.subscribe_topic(&topic, None).await {
                Ok(true) => {
                    info!("Subscribed to index topic {}", topic);
                    subscribed += 1;
                }
                Ok(false) => debug!("Index topic {} already active", topic),
                Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
            }
        }

        subscribed
    }

    /// Subscribe one topic with no attribution
    ///
    /// `Ok(false)` means the topic was already active and nothing was sent.
    pub async fn subscribe(&self, topic: &str) -> TransportResult<bool> {
        self.subscribe_topic(topic, None).await
    }

    /// Claim the topic, then subscribe; the claim is released on failure
    ///
    /// Metadata goes in together with the claim so a payload arriving right
    /// after the SUBSCRIBE is already attributable.
    async fn subscribe_topic(
        &self,
        topic: &str,
        metadata: Option<TopicMetadata>,
    ) -> TransportResult<bool> {
        {
            let mut state = self.state.write();
            if !state.active_topics.insert(topic.to_string()) {
                return Ok(false);
            }
            if let Some(metadata) = metadata {
                state.metadata.insert(topic.to_string(), metadata);
            }
        }

        if let Err(e) = self.transport.subscribe(topic).await {
            let mut state = self.state.write();
            state.active_topics.remove(topic);
            state.metadata.remove(topic);
            return Err(e);
        }

        Ok(true)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.read().active_topics.contains(topic)
    }

    pub fn active_count(&self) -> usize {
        self.state.read().active_topics.len()
    }

    /// Attribution recorded when a derivative topic was subscribed
    pub fn metadata(&self, topic: &str) -> Option<TopicMetadata> {
        self.state.read().metadata.get(topic).cloned()
    }

    pub fn last_price(&self, index: &str) -> Option<Decimal> {
        self.state.read().last_price.get(index).copied()
    }

    pub fn last_atm(&self, index: &str) -> Option<Decimal> {
        self.state.read().last_atm.get(index).copied()
    }

    /// Record a price seen on an index topic
    ///
    /// Returns the ATM strike only for the first price of a configured index;
    /// every later call (and any untracked index) returns `None`.
    pub fn observe_index_price(&self, index: &str, price: Decimal) -> Option<Decimal> {
        self.state
            .write()
            .last_price
            .insert(index.to_string(), price);

        let flag = self.awaiting_first.get(index)?;
        if flag
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let Some(increment) = self.app.strike_increment(index) else {
            warn!("No strike increment configured for {}, not expanding", index);
            return None;
        };
        let Some(atm) = atm_strike(price, increment) else {
            warn!("Invalid strike increment {} for {}", increment, index);
            return None;
        };

        info!("First price for {}: {} -> ATM {}", index, price, atm);
        self.state.write().last_atm.insert(index.to_string(), atm);
        Some(atm)
    }

    /// Subscribe calls and puts for the strike window around `atm`
    ///
    /// Each leg is independent: a failed lookup or subscribe skips that leg only.
    pub async fn expand_window(&self, index: &str, atm: Decimal) -> ExpansionReport {
        let mut report = ExpansionReport {
            index: index.to_string(),
            atm,
            ..ExpansionReport::default()
        };

        let (Some(increment), Some(expiry)) =
            (self.app.strike_increment(index), self.app.expiry_date(index))
        else {
            warn!("Missing strike increment or expiry for {}, not expanding", index);
            return report;
        };

        let strikes = strike_window(atm, increment, self.app.strike_range);
        let legs = strikes.iter().flat_map(|strike| {
            OptionType::ALL.into_iter().map(move |option_type| TokenQuery {
                index: index.to_string(),
                expiry_date: expiry.to_string(),
                option_type,
                strike: *strike,
            })
        });

        let outcomes = join_all(legs.map(|query| self.expand_leg(query))).await;

        report.attempted = outcomes.len();
        for outcome in outcomes {
            match outcome {
                LegOutcome::Subscribed => report.subscribed += 1,
                LegOutcome::AlreadyActive => report.already_active += 1,
                LegOutcome::LookupFailed => report.lookup_failures += 1,
                LegOutcome::SubscribeFailed => report.subscribe_failures += 1,
            }
        }

        info!(
            "Expanded {} around ATM {}: {} subscribed, {} already active, {} lookups failed, {} subscribes failed",
            index,
            atm,
            report.subscribed,
            report.already_active,
            report.lookup_failures,
            report.subscribe_failures
        );
        report
    }

    /// Observe the price and, on the first one, expand the window
    pub async fn on_index_price(&self, index: &str, price: Decimal) -> Option<ExpansionReport> {
        let atm = self.observe_index_price(index, price)?;
        Some(self.expand_window(index, atm).await)
    }

    /// Token lookup bounded by the configured timeout
    async fn lookup_token(&self, query: &TokenQuery) -> LookupResult<String> {
        tokio::time::timeout(self.lookup_timeout, self.tokens.lookup(query))
            .await
            .map_err(|_| LookupError::Timeout(self.lookup_timeout))?
    }

    async fn expand_leg(&self, query: TokenQuery) -> LegOutcome {
        let token = match self.lookup_token(&query).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Token lookup failed for {}: {}", query, e);
                return LegOutcome::LookupFailed;
            }
        };

        let topic = self.app.option_topic(&token);
        let metadata = TopicMetadata {
            index: query.index.clone(),
            option_type: query.option_type,
            strike: query.strike,
        };

        match self.subscribe_topic(&topic, Some(metadata)).await {
            Ok(true) => {
                debug!("Subscribed to {} ({})", topic, query);
                LegOutcome::Subscribed
            }
            Ok(false) => LegOutcome::AlreadyActive,
            Err(e) => {
                warn!("Failed to subscribe to {} ({}): {}", topic, query, e);
                LegOutcome::SubscribeFailed
            }
        }
    }
}
