//! Subscription manager events and the listener-token model that replaces a mutable listener
//! set with unclear removal semantics. `on(...)` returns a [`ListenerToken`]
//! whose `cancel()` guarantees the listener is not invoked again, even if a notification is
//! already in flight when `cancel` is called from another task, since the registry is guarded
//! by the same lock that drives dispatch.

use crate::subscription::{SubscriptionInfo, SubscriptionStats};
use crate::util::Emitter;
use std::time::SystemTime;

pub use crate::util::ListenerToken;

/// A batch subscribe/unsubscribe outcome.
#[derive(Clone, Debug)]
pub struct BatchResult {
    pub successful: Vec<SubscriptionInfo>,
    pub failed: Vec<(crate::subscription::Subscription, crate::error::CoreError)>,
    pub existing: Vec<SubscriptionInfo>,
}

impl BatchResult {
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            successful: self.successful.len(),
            failed: self.failed.len(),
            existing: self.existing.len(),
        }
    }
}

/// `{successful, failed, existing}` count summary.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct BatchSummary {
    pub successful: usize,
    pub failed: usize,
    pub existing: usize,
}

/// Events emitted by the subscription manager.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    Initialized {
        timestamp: SystemTime,
    },
    SubscriptionAdded {
        summary: BatchSummary,
        timestamp: SystemTime,
    },
    SubscriptionRemoved {
        summary: BatchSummary,
        timestamp: SystemTime,
    },
    SubscriptionStatusChanged {
        key: crate::subscription::SubscriptionKey,
        old: crate::subscription::SubscriptionStatus,
        new: crate::subscription::SubscriptionStatus,
    },
    StatsUpdated {
        stats: SubscriptionStats,
        timestamp: SystemTime,
    },
}

/// Registry of event listeners backing the subscription manager's `on`/emit API. A thin
/// newtype over the generic [`Emitter`] so call sites get a `SubscriptionEvent`-specific type.
#[derive(Clone, Default)]
pub struct EventEmitter(Emitter<SubscriptionEvent>);

impl EventEmitter {
    pub fn new() -> Self {
        Self(Emitter::new())
    }

    /// Registers a listener, returning a [`ListenerToken`] that can cancel it later.
    pub fn on<F>(&self, listener: F) -> ListenerToken<SubscriptionEvent>
    where
        F: Fn(&SubscriptionEvent) + Send + Sync + 'static,
    {
        self.0.on(listener)
    }

    /// Dispatches `event` to every currently-registered listener. Listeners removed by a prior
    /// `cancel()` call are never invoked, because removal happens under the same lock snapshot
    /// taken here.
    pub fn emit(&self, event: SubscriptionEvent) {
        self.0.emit(event)
    }

    pub fn listener_count(&self) -> usize {
        self.0.listener_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn cancelled_listener_is_not_invoked_again() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let token = emitter.on(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(SubscriptionEvent::Initialized {
            timestamp: SystemTime::now(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);

        token.cancel();
        emitter.emit(SubscriptionEvent::Initialized {
            timestamp: SystemTime::now(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn multiple_listeners_are_independent() {
        let emitter = EventEmitter::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (a2, b2) = (Arc::clone(&a), Arc::clone(&b));

        let token_a = emitter.on(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let _token_b = emitter.on(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        });

        token_a.cancel();
        emitter.emit(SubscriptionEvent::Initialized {
            timestamp: SystemTime::now(),
        });

        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }
}
