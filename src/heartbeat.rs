//! Heartbeat controller. Per-connection ping/pong accounting, health score,
//! timeout detection.

use crate::config::HeartbeatConfig;
use crate::error::CoreError;
use crate::util::{clamp_unit, Emitter, ListenerToken};
use bounded_vec_deque::BoundedVecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

const PONG_DURATION_RING_LEN: usize = 100;

/// Counters and timing state tracked by the heartbeat controller.
#[derive(Clone, Debug)]
pub struct HeartbeatStats {
    pub pings_received: u64,
    pub pongs_sent: u64,
    pub unsolicited_pongs_sent: u64,
    pub heartbeat_timeouts: u64,
    pub last_ping_time: Option<Instant>,
    pub last_pong_time: Option<Instant>,
    pub last_ping_interval: Option<Duration>,
}

impl Default for HeartbeatStats {
    fn default() -> Self {
        Self {
            pings_received: 0,
            pongs_sent: 0,
            unsolicited_pongs_sent: 0,
            heartbeat_timeouts: 0,
            last_ping_time: None,
            last_pong_time: None,
            last_ping_interval: None,
        }
    }
}

/// Per-factor breakdown of the [0,1] health score.
#[derive(Copy, Clone, Debug, Default)]
pub struct HealthScore {
    pub response_time: f64,
    pub heartbeat_frequency: f64,
    pub timeout_factor: f64,
    pub pong_success: f64,
}

impl HealthScore {
    pub fn total(&self) -> f64 {
        0.3 * self.response_time
            + 0.4 * self.heartbeat_frequency
            + 0.2 * self.timeout_factor
            + 0.1 * self.pong_success
    }
}

/// Event emitted when the health score moves by more than 0.1.
#[derive(Copy, Clone, Debug)]
pub struct HealthChanged {
    pub previous: f64,
    pub current: f64,
}

struct State {
    stats: HeartbeatStats,
    pong_durations: BoundedVecDeque<Duration>,
    last_score: f64,
}

/// Tracks ping/pong traffic for one connection and answers health-score / timeout queries.
pub struct HeartbeatController {
    config: HeartbeatConfig,
    state: Mutex<State>,
    health_events: Emitter<HealthChanged>,
}

impl HeartbeatController {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                stats: HeartbeatStats::default(),
                pong_durations: BoundedVecDeque::new(PONG_DURATION_RING_LEN),
                last_score: 1.0,
            }),
            health_events: Emitter::new(),
        }
    }

    pub fn on_health_changed<F>(&self, listener: F) -> ListenerToken<HealthChanged>
    where
        F: Fn(&HealthChanged) + Send + Sync + 'static,
    {
        self.health_events.on(listener)
    }

    /// Records receipt of a ping frame and returns the pong payload to send back. The caller
    /// must write this pong synchronously, before returning from the frame handler, so the
    /// recorded response time reflects actual wire latency rather than queueing delay.
    pub fn handle_ping(&self, payload: Vec<u8>) -> Vec<u8> {
        let send_start = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(last) = state.stats.last_ping_time {
                state.stats.last_ping_interval = Some(send_start.duration_since(last));
            }
            state.stats.pings_received += 1;
            state.stats.last_ping_time = Some(send_start);
        }
        self.record_pong_sent(send_start, false);
        payload
    }

    /// Records an unsolicited (empty-payload) pong emitted on the configured interval. These
    /// never substitute for reactive pongs.
    pub fn record_unsolicited_pong(&self) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            state.stats.unsolicited_pongs_sent += 1;
        }
        self.record_pong_sent(now, true);
    }

    fn record_pong_sent(&self, send_start: Instant, _unsolicited: bool) {
        let duration = send_start.elapsed();
        let mut state = self.state.lock().unwrap();
        state.stats.pongs_sent += 1;
        state.stats.last_pong_time = Some(Instant::now());
        state.pong_durations.push_back(duration);

        let score_before = state.last_score;
        let score_after = breakdown(&state, &self.config).total();
        state.last_score = score_after;
        drop(state);

        if (score_after - score_before).abs() > 0.1 {
            self.health_events.emit(HealthChanged {
                previous: score_before,
                current: score_after,
            });
        }
    }

    /// Surfaces a `HEARTBEAT` error when `now - lastPingTime > pingTimeoutThreshold`, and
    /// increments the timeout counter.
    pub fn check_timeout(&self, now: Instant) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(last_ping) = state.stats.last_ping_time else {
            return Ok(());
        };
        if now.duration_since(last_ping) > self.config.ping_timeout_threshold {
            state.stats.heartbeat_timeouts += 1;
            warn!(timeouts = state.stats.heartbeat_timeouts, "heartbeat timeout detected");
            return Err(CoreError::heartbeat("ping timeout exceeded threshold"));
        }
        Ok(())
    }

    pub fn stats(&self) -> HeartbeatStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Weighted sum over the four health factors.
    pub fn health_score(&self) -> HealthScore {
        let state = self.state.lock().unwrap();
        breakdown(&state, &self.config)
    }
}

/// Computes the per-factor health score breakdown from an already-locked [`State`]. Kept as a free function so callers holding the lock (e.g. to update stats and then
/// check for a >0.1 score change in one critical section) don't have to re-lock.
fn breakdown(state: &State, config: &HeartbeatConfig) -> HealthScore {
    let avg_pong_duration = if state.pong_durations.is_empty() {
        Duration::ZERO
    } else {
        let total: Duration = state.pong_durations.iter().sum();
        total / state.pong_durations.len() as u32
    };
    let response_time = clamp_unit(
        1.0 - avg_pong_duration.as_secs_f64() / config.pong_response_timeout.as_secs_f64(),
    );

    let heartbeat_frequency = match state.stats.last_ping_interval {
        Some(delta) => {
            let expected = Duration::from_secs(20).as_secs_f64();
            clamp_unit(1.0 - (delta.as_secs_f64() - expected).abs() / expected)
        }
        None => 1.0,
    };

    let timeout_factor = clamp_unit(1.0 - state.stats.heartbeat_timeouts as f64 / 10.0);

    let pong_success = if state.stats.pings_received == 0 {
        1.0
    } else {
        clamp_unit(state.stats.pongs_sent as f64 / state.stats.pings_received as f64)
    };

    HealthScore {
        response_time,
        heartbeat_frequency,
        timeout_factor,
        pong_success,
    }
}
