//! Subscription data model underpinning the subscription manager.

pub mod events;
pub mod manager;

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

/// The set of logical data feeds a [`Subscription`] can request.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Trade,
    Ticker,
    Depth,
    OrderBook,
    Kline1m,
    Kline5m,
    Kline15m,
    Kline30m,
    Kline1h,
    Kline4h,
    Kline1d,
}

impl DataType {
    /// Binance kline interval token used both in stream-name construction and in the
    /// parser's discriminator-to-`DataType` mapping. Each interval is modeled as a distinct
    /// `DataType` variant rather than a shared type with an interval field, so routing and
    /// subscription identity both treat different intervals as different logical feeds.
    pub fn kline_interval(&self) -> Option<&'static str> {
        match self {
            DataType::Kline1m => Some("1m"),
            DataType::Kline5m => Some("5m"),
            DataType::Kline15m => Some("15m"),
            DataType::Kline30m => Some("30m"),
            DataType::Kline1h => Some("1h"),
            DataType::Kline4h => Some("4h"),
            DataType::Kline1d => Some("1d"),
            _ => None,
        }
    }

    pub fn from_kline_interval(interval: &str) -> Option<Self> {
        match interval {
            "1m" => Some(DataType::Kline1m),
            "5m" => Some(DataType::Kline5m),
            "15m" => Some(DataType::Kline15m),
            "30m" => Some(DataType::Kline30m),
            "1h" => Some(DataType::Kline1h),
            "4h" => Some(DataType::Kline4h),
            "1d" => Some(DataType::Kline1d),
            _ => None,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Opaque, order-independent hash of a subscription's extra parameters, used as the third
/// component of [`SubscriptionKey`] (: `symbol|dataType|hash(params)`).
pub fn hash_params(params: &Option<std::collections::BTreeMap<String, String>>) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(params) = params {
        for (k, v) in params {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Identity key of a [`Subscription`]: unique within the active set.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub data_type: DataType,
    pub params_hash: u64,
}

impl Display for SubscriptionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.symbol, self.data_type, self.params_hash)
    }
}

/// Client-level subscription request.
#[derive(Clone, Debug)]
pub struct Subscription {
    /// Canonical uppercase, concatenated storage form, e.g. `BTCUSDT`.
    pub symbol: String,
    pub data_type: DataType,
    pub params: Option<std::collections::BTreeMap<String, String>>,
}

impl Subscription {
    pub fn new(symbol: impl Into<String>, data_type: DataType) -> Self {
        Self {
            symbol: symbol.into().to_uppercase(),
            data_type,
            params: None,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            symbol: self.symbol.clone(),
            data_type: self.data_type,
            params_hash: hash_params(&self.params),
        }
    }

    /// `BASE/QUOTE` display form, derived the same way the parser's symbol normalizer works so
    /// the two stay consistent.
    pub fn display_symbol(&self) -> String {
        crate::exchange::binance::parser::normalize_symbol(&self.symbol)
    }
}

/// Lifecycle status of a [`Subscription`] in the manager's ledger.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Removing,
    Removed,
    Failed,
}

impl SubscriptionStatus {
    /// Valid forward transitions 
    /// `PENDING -> ACTIVE -> (REMOVING -> REMOVED) | FAILED`.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Failed)
                | (Active, Removing)
                | (Active, Failed)
                | (Removing, Removed)
                | (Removing, Failed)
        )
    }
}

/// Authoritative record the manager keeps for one active or in-flight subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionInfo {
    pub key: SubscriptionKey,
    pub subscription: Subscription,
    pub status: SubscriptionStatus,
    pub connection_id: Option<String>,
    pub subscribed_at: SystemTime,
    pub last_active_at: SystemTime,
    pub message_count: u64,
    pub error_count: u64,
}

impl SubscriptionInfo {
    pub fn new(subscription: Subscription) -> Self {
        let now = SystemTime::now();
        Self {
            key: subscription.key(),
            subscription,
            status: SubscriptionStatus::Pending,
            connection_id: None,
            subscribed_at: now,
            last_active_at: now,
            message_count: 0,
            error_count: 0,
        }
    }

    pub fn transition(&mut self, next: SubscriptionStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::subscription(format!(
                "invalid subscription status transition {:?} -> {:?}",
                self.status, next
            )));
        }
        self.status = next;
        self.last_active_at = SystemTime::now();
        Ok(())
    }

    pub fn record_message(&mut self) {
        self.message_count += 1;
        self.last_active_at = SystemTime::now();
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }
}

/// Aggregate counts returned by `getSubscriptionStats`.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionStats {
    pub total: usize,
    pub by_status: std::collections::HashMap<String, usize>,
    pub by_symbol: std::collections::HashMap<String, usize>,
    pub by_data_type: std::collections::HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_is_stable_for_equivalent_subscriptions() {
        let a = Subscription::new("btcusdt", DataType::Trade);
        let b = Subscription::new("BTCUSDT", DataType::Trade);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn status_transitions_follow_spec_lifecycle() {
        use SubscriptionStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Removing));
        assert!(Removing.can_transition_to(Removed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Removed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Removed));
    }
}
