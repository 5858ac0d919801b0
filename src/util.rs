use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Determine the `DateTime<Utc>` from the provided `u64` milliseconds since the epoch.
pub fn epoch_ms_to_datetime_utc(epoch_ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH + Duration::from_millis(epoch_ms))
}

/// Clamp a factor contribution to `[0, 1]`.
pub fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Token returned by [`Emitter::on`]. Dropping or calling `cancel()` removes the listener;
/// subsequent dispatches are guaranteed not to invoke it.
#[derive(Clone)]
pub struct ListenerToken<T> {
    id: u64,
    registry: Arc<Mutex<HashMap<u64, Listener<T>>>>,
}

impl<T> ListenerToken<T> {
    pub fn cancel(&self) {
        self.registry.lock().unwrap().remove(&self.id);
    }
}

/// Generic observer registry used by every component that needs an `on(...) -> token` /
/// `emit(event)` API (heartbeat health changes, subscription lifecycle, buffer/router events),
/// so the cancellation-safe listener model described in the design is implemented once.
pub struct Emitter<T> {
    listeners: Arc<Mutex<HashMap<u64, Listener<T>>>>,
    next_id: Arc<AtomicU64>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, listener: F) -> ListenerToken<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().insert(id, Box::new(listener));
        ListenerToken {
            id,
            registry: Arc::clone(&self.listeners),
        }
    }

    pub fn emit(&self, event: T) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.values() {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_unit_bounds_values() {
        assert_eq!(clamp_unit(-1.0), 0.0);
        assert_eq!(clamp_unit(2.0), 1.0);
        assert_eq!(clamp_unit(0.5), 0.5);
    }
}
