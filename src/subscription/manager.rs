//! Subscription manager. Authoritative ledger of logical subscriptions:
//! validation, batch add/remove, lifecycle events, resubscribe-on-reconnect.

use crate::config::SubscriptionManagerConfig;
use crate::error::CoreError;
use crate::subscription::events::{
    BatchResult, BatchSummary, EventEmitter, ListenerToken, SubscriptionEvent,
};
use crate::subscription::{Subscription, SubscriptionInfo, SubscriptionKey, SubscriptionStats, SubscriptionStatus};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Inner {
    initialized: bool,
    config: Option<SubscriptionManagerConfig>,
    symbol_regex: Option<Regex>,
    active: HashMap<SubscriptionKey, SubscriptionInfo>,
}

impl Inner {
    fn new() -> Self {
        Self {
            initialized: false,
            config: None,
            symbol_regex: None,
            active: HashMap::new(),
        }
    }
}

/// The single-writer, many-reader authoritative subscription ledger.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Mutex<Inner>>,
    events: EventEmitter,
    stats_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            events: EventEmitter::new(),
            stats_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Validates and records `cfg`. Fails if called twice.
    pub fn initialize(&self, cfg: SubscriptionManagerConfig) -> Result<(), CoreError> {
        cfg.validate()?;
        let regex = Regex::new(&cfg.validation.symbol_pattern)?;

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.initialized {
                return Err(CoreError::config("already initialized"));
            }
            inner.initialized = true;
            inner.symbol_regex = Some(regex);
            inner.config = Some(cfg);
        }

        self.events.emit(SubscriptionEvent::Initialized {
            timestamp: SystemTime::now(),
        });
        self.spawn_stats_loop();
        info!("subscription manager initialized");
        Ok(())
    }

    fn spawn_stats_loop(&self) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                let stats = manager.get_subscription_stats();
                manager.events.emit(SubscriptionEvent::StatsUpdated {
                    stats,
                    timestamp: SystemTime::now(),
                });
            }
        });
        *self.stats_task.lock().unwrap() = Some(handle);
    }

    /// Register a listener for subscription lifecycle events. Returns a token whose `cancel()`
    /// guarantees the listener will not be invoked again.
    pub fn on<F>(&self, listener: F) -> ListenerToken<SubscriptionEvent>
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    fn require_config(&self, inner: &Inner) -> Result<SubscriptionManagerConfig, CoreError> {
        inner
            .config
            .clone()
            .ok_or_else(|| CoreError::config("subscription manager not initialized"))
    }

    fn validate_one(
        &self,
        sub: &Subscription,
        cfg: &SubscriptionManagerConfig,
        regex: &Regex,
    ) -> Result<(), CoreError> {
        if !regex.is_match(&sub.symbol) {
            return Err(CoreError::subscription(format!(
                "symbol '{}' does not match pattern '{}'",
                sub.symbol, cfg.validation.symbol_pattern
            )));
        }
        if cfg.validation.disabled_data_types.contains(&sub.data_type) {
            return Err(CoreError::subscription(format!(
                "data type {:?} is disabled",
                sub.data_type
            )));
        }
        Ok(())
    }

    /// Batch-subscribe. A batch that would exceed `maxSubscriptions` fails wholesale with an
    /// error and no item enters the active set; otherwise each item is
    /// validated individually and partial success is returned via [`BatchResult`].
    pub fn subscribe(&self, subs: Vec<Subscription>) -> Result<BatchResult, CoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.initialized {
            return Err(CoreError::config("subscription manager not initialized"));
        }
        let cfg = self.require_config(&inner)?;
        let regex = inner.symbol_regex.clone().expect("regex set when initialized");

        // Partition requested subs into existing (duplicate identity keys) vs genuinely new,
        // before applying the whole-batch capacity check.
        let mut existing = Vec::new();
        let mut new_subs = Vec::new();
        for sub in subs {
            let key = sub.key();
            if let Some(info) = inner.active.get(&key) {
                existing.push(info.clone());
            } else {
                new_subs.push(sub);
            }
        }

        let projected = inner.active.len() + new_subs.len();
        if projected > cfg.validation.max_subscriptions {
            return Err(CoreError::subscription(format!(
                "Would exceed maximum subscriptions: {} > {}",
                projected, cfg.validation.max_subscriptions
            )));
        }

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        let mut status_changes = Vec::new();
        for sub in new_subs {
            match self.validate_one(&sub, &cfg, &regex) {
                Ok(()) => {
                    let mut info = SubscriptionInfo::new(sub);
                    let old_status = info.status;
                    info.transition(SubscriptionStatus::Active).expect("pending->active is valid");
                    status_changes.push((info.key.clone(), old_status, info.status));
                    inner.active.insert(info.key.clone(), info.clone());
                    successful.push(info);
                }
                Err(err) => {
                    failed.push((sub, err));
                }
            }
        }

        drop(inner);

        let result = BatchResult {
            successful,
            failed,
            existing,
        };
        for (key, old, new) in status_changes {
            self.events.emit(SubscriptionEvent::SubscriptionStatusChanged { key, old, new });
        }
        self.events.emit(SubscriptionEvent::SubscriptionAdded {
            summary: result.summary(),
            timestamp: SystemTime::now(),
        });
        debug!(summary = ?result.summary(), "subscribe batch processed");
        Ok(result)
    }

    /// Batch-unsubscribe. Non-existent entries are not errors; they are simply absent from
    /// `successful`.
    pub fn unsubscribe(&self, subs: Vec<Subscription>) -> Result<BatchResult, CoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.initialized {
            return Err(CoreError::config("subscription manager not initialized"));
        }

        let mut successful = Vec::new();
        let mut status_changes = Vec::new();
        for sub in subs {
            let key = sub.key();
            if let Some(mut info) = inner.active.remove(&key) {
                let before_removing = info.status;
                if info.transition(SubscriptionStatus::Removing).is_ok() {
                    status_changes.push((key.clone(), before_removing, info.status));
                }
                let before_removed = info.status;
                if info.transition(SubscriptionStatus::Removed).is_ok() {
                    status_changes.push((key.clone(), before_removed, info.status));
                }
                successful.push(info);
            }
        }
        drop(inner);

        let result = BatchResult {
            successful,
            failed: Vec::new(),
            existing: Vec::new(),
        };
        for (key, old, new) in status_changes {
            self.events.emit(SubscriptionEvent::SubscriptionStatusChanged { key, old, new });
        }
        self.events.emit(SubscriptionEvent::SubscriptionRemoved {
            summary: result.summary(),
            timestamp: SystemTime::now(),
        });
        Ok(result)
    }

    pub fn has_subscription(&self, sub: &Subscription) -> bool {
        self.inner.lock().unwrap().active.contains_key(&sub.key())
    }

    pub fn get_active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.lock().unwrap().active.values().cloned().collect()
    }

    pub fn get_subscription_stats(&self) -> SubscriptionStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = SubscriptionStats {
            total: inner.active.len(),
            ..Default::default()
        };
        for info in inner.active.values() {
            *stats
                .by_status
                .entry(format!("{:?}", info.status))
                .or_insert(0) += 1;
            *stats.by_symbol.entry(info.subscription.symbol.clone()).or_insert(0) += 1;
            *stats
                .by_data_type
                .entry(info.subscription.data_type.to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Idempotent: a second call is a no-op and does not error.
    pub fn clear_all_subscriptions(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.clear();
    }

    pub fn destroy(&self) {
        if let Some(handle) = self.stats_task.lock().unwrap().take() {
            handle.abort();
        }
        self.clear_all_subscriptions();
    }

    /// Re-drives the subscriptions that were bound to `old_connection_id` through `subscribe`
    /// again against `new_connection_id`, preserving identity keys and original `subscribedAt`.
    /// Called when the connection pool signals a connection replacement.
    pub fn resubscribe_on_reconnect(&self, old_connection_id: &str, new_connection_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let affected_keys: Vec<SubscriptionKey> = inner
            .active
            .iter()
            .filter(|(_, info)| info.connection_id.as_deref() == Some(old_connection_id))
            .map(|(key, _)| key.clone())
            .collect();

        for key in affected_keys {
            if let Some(info) = inner.active.get_mut(&key) {
                info.connection_id = Some(new_connection_id.to_string());
                info.last_active_at = SystemTime::now();
            }
        }
        warn!(
            old_connection_id,
            new_connection_id, "resubscribed active subscriptions onto replacement connection"
        );
    }

    pub fn bind_connection(&self, key: &SubscriptionKey, connection_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner.active.get_mut(key) {
            info.connection_id = Some(connection_id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::DataType;

    fn manager_with_cap(cap: usize) -> SubscriptionManager {
        let manager = SubscriptionManager::new();
        let mut cfg = SubscriptionManagerConfig::default();
        cfg.validation.max_subscriptions = cap;
        manager.initialize(cfg).unwrap();
        manager
    }

    #[tokio::test]
    async fn bulk_subscribe_over_cap_fails_wholesale() {
        let manager = manager_with_cap(1000);
        let subs: Vec<_> = (0..1001)
            .map(|i| Subscription::new(format!("SYM{i}"), DataType::Trade))
            .collect();

        let err = manager.subscribe(subs).unwrap_err();
        assert!(err.message.contains("Would exceed maximum subscriptions: 1001 > 1000"));
        assert_eq!(manager.get_active_subscriptions().len(), 0);
    }

    #[tokio::test]
    async fn duplicate_subscriptions_land_in_existing() {
        let manager = manager_with_cap(10);
        let sub = Subscription::new("BTCUSDT", DataType::Trade);

        let first = manager.subscribe(vec![sub.clone()]).unwrap();
        assert_eq!(first.summary().successful, 1);

        let second = manager.subscribe(vec![sub]).unwrap();
        assert_eq!(second.summary().successful, 0);
        assert_eq!(second.summary().existing, 1);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_clears_membership() {
        let manager = manager_with_cap(10);
        let subs = vec![
            Subscription::new("BTCUSDT", DataType::Trade),
            Subscription::new("ETHUSDT", DataType::Ticker),
        ];
        manager.subscribe(subs.clone()).unwrap();
        for sub in &subs {
            assert!(manager.has_subscription(sub));
        }

        manager.unsubscribe(subs.clone()).unwrap();
        for sub in &subs {
            assert!(!manager.has_subscription(sub));
        }
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_subscription_is_not_an_error() {
        let manager = manager_with_cap(10);
        let result = manager
            .unsubscribe(vec![Subscription::new("BTCUSDT", DataType::Trade)])
            .unwrap();
        assert_eq!(result.summary().successful, 0);
    }

    #[tokio::test]
    async fn clear_all_subscriptions_is_idempotent() {
        let manager = manager_with_cap(10);
        manager
            .subscribe(vec![Subscription::new("BTCUSDT", DataType::Trade)])
            .unwrap();
        manager.clear_all_subscriptions();
        manager.clear_all_subscriptions();
        assert_eq!(manager.get_active_subscriptions().len(), 0);
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_emit_status_changed_events() {
        let manager = manager_with_cap(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _token = manager.on(move |event| {
            if let SubscriptionEvent::SubscriptionStatusChanged { old, new, .. } = event {
                seen_clone.lock().unwrap().push((*old, *new));
            }
        });

        let sub = Subscription::new("BTCUSDT", DataType::Trade);
        manager.subscribe(vec![sub.clone()]).unwrap();
        manager.unsubscribe(vec![sub]).unwrap();

        let transitions = seen.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                (SubscriptionStatus::Pending, SubscriptionStatus::Active),
                (SubscriptionStatus::Active, SubscriptionStatus::Removing),
                (SubscriptionStatus::Removing, SubscriptionStatus::Removed),
            ]
        );
    }

    #[tokio::test]
    async fn double_initialize_fails() {
        let manager = manager_with_cap(10);
        let err = manager.initialize(SubscriptionManagerConfig::default()).unwrap_err();
        assert!(err.message.contains("already initialized"));
    }

    #[tokio::test]
    async fn resubscribe_on_reconnect_preserves_identity_and_subscribed_at() {
        let manager = manager_with_cap(10);
        let sub = Subscription::new("BTCUSDT", DataType::Trade);
        let result = manager.subscribe(vec![sub.clone()]).unwrap();
        let info = &result.successful[0];
        manager.bind_connection(&info.key, "conn-a");
        let original_subscribed_at = info.subscribed_at;

        manager.resubscribe_on_reconnect("conn-a", "conn-b");

        let active = manager.get_active_subscriptions();
        let migrated = active.iter().find(|i| i.key == sub.key()).unwrap();
        assert_eq!(migrated.connection_id.as_deref(), Some("conn-b"));
        assert_eq!(migrated.subscribed_at, original_subscribed_at);
    }
}
