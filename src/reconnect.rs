//! Reconnect strategy. Exponential backoff with jitter, retryability
//! classification, attempt counter reset.

use crate::config::ReconnectConfig;
use crate::error::ErrorKind;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Computes backoff delays and tracks the retry attempt counter for one connection.
pub struct ReconnectStrategy {
    config: ReconnectConfig,
    attempt: AtomicU32,
    last_connected_at: std::sync::Mutex<Option<Instant>>,
}

impl ReconnectStrategy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: AtomicU32::new(0),
            last_connected_at: std::sync::Mutex::new(None),
        }
    }

    /// Whether an error of `kind` should trigger a reconnect attempt:
    /// `CONNECTION`/`HEARTBEAT` reconnect; `DATA` (parse), `PROTOCOL` (clean close), `AUTH`, and
    /// `CONFIG` do not.
    pub fn should_reconnect(&self, kind: ErrorKind) -> bool {
        kind.is_retryable()
    }

    /// Delay for attempt `n` (1-indexed): `min(maxDelay, initialDelay * multiplier^(n-1))` with
    /// optional uniform `[-0.2, +0.2]` jitter.
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let n = n.max(1);
        let exp = self.config.backoff_multiplier.powi(n as i32 - 1);
        let base_ms = self.config.initial_delay.as_secs_f64() * 1000.0 * exp;
        let capped_ms = base_ms.min(self.config.max_delay.as_secs_f64() * 1000.0);

        let jittered_ms = if self.config.jitter {
            let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
            (capped_ms * (1.0 + jitter_fraction)).max(0.0)
        } else {
            capped_ms
        };

        Duration::from_secs_f64(jittered_ms / 1000.0)
    }

    /// Records a new reconnect attempt and returns its delay. Once `maxRetries` attempts have
    /// been made, returns `None`, signalling the owning connection must transition to
    /// `TERMINATED`.
    pub fn next_attempt(&self) -> Option<Duration> {
        let n = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        if n > self.config.max_retries {
            return None;
        }
        Some(self.delay_for_attempt(n))
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Call when the connection reaches a stable `CONNECTED`/`ACTIVE` state. Resets the attempt
    /// counter once `resetAfter` of continuous connected time has elapsed.
    pub fn mark_connected(&self) {
        *self.last_connected_at.lock().unwrap() = Some(Instant::now());
    }

    /// Should be polled periodically (or on the next reconnect decision) while connected; resets
    /// the counter if enough uninterrupted connected time has accrued.
    pub fn maybe_reset(&self, now: Instant) {
        let connected_since = *self.last_connected_at.lock().unwrap();
        if let Some(since) = connected_since {
            if now.duration_since(since) >= self.config.reset_after {
                self.attempt.store(0, Ordering::SeqCst);
            }
        }
    }

    pub fn mark_disconnected(&self) {
        *self.last_connected_at.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_config() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_retries: 5,
            jitter: false,
            reset_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn delay_grows_exponentially_and_saturates() {
        let strategy = ReconnectStrategy::new(no_jitter_config());
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_millis(400));
        // Saturates once initial * multiplier^(n-1) exceeds maxDelay.
        assert_eq!(strategy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn jittered_delay_stays_within_twenty_percent_band() {
        let mut cfg = no_jitter_config();
        cfg.jitter = true;
        let strategy = ReconnectStrategy::new(cfg);
        let delay = strategy.delay_for_attempt(1).as_secs_f64();
        assert!(delay >= 0.1 * 0.8 - 1e-9);
        assert!(delay <= 0.1 * 1.2 + 1e-9);
    }

    #[test]
    fn exhausting_retries_returns_none() {
        let strategy = ReconnectStrategy::new(no_jitter_config());
        for _ in 0..5 {
            assert!(strategy.next_attempt().is_some());
        }
        assert!(strategy.next_attempt().is_none());
    }

    #[test]
    fn retryability_matches_error_kind_table() {
        let strategy = ReconnectStrategy::new(no_jitter_config());
        assert!(strategy.should_reconnect(ErrorKind::Connection));
        assert!(strategy.should_reconnect(ErrorKind::Heartbeat));
        assert!(!strategy.should_reconnect(ErrorKind::Data));
        assert!(!strategy.should_reconnect(ErrorKind::Protocol));
        assert!(!strategy.should_reconnect(ErrorKind::Auth));
        assert!(!strategy.should_reconnect(ErrorKind::Config));
    }

    #[test]
    fn counter_resets_after_sustained_connection() {
        let mut cfg = no_jitter_config();
        cfg.reset_after = Duration::from_millis(20);
        let strategy = ReconnectStrategy::new(cfg);
        strategy.next_attempt();
        strategy.next_attempt();
        assert_eq!(strategy.attempt_count(), 2);

        strategy.mark_connected();
        std::thread::sleep(Duration::from_millis(30));
        strategy.maybe_reset(Instant::now());
        assert_eq!(strategy.attempt_count(), 0);
    }
}
