//! Single WebSocket connection. Owns the socket, the heartbeat controller
//! and reconnect strategy for that socket, and the set of logical stream names currently bound
//! to it; drives the per-connection state machine and the per-frame receive pipeline.

use crate::config::{HeartbeatConfig, ReconnectConfig};
use crate::error::CoreError;
use crate::heartbeat::{HealthScore, HeartbeatController, HeartbeatStats};
use crate::reconnect::ReconnectStrategy;
use crate::util::{Emitter, ListenerToken};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// States of the per-connection lifecycle. `AUTHENTICATING` and `SUBSCRIBING`
/// are transient: a public market-data connection passes through `CONNECTED` straight to
/// `ACTIVE`, and re-enters `SUBSCRIBING` only for the duration of an individual subscribe call.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Authenticating,
    Subscribing,
    Active,
    HeartbeatFailed,
    Disconnecting,
    Disconnected,
    Reconnecting,
    Terminated,
    Error,
}

/// Emitted on every state transition.
#[derive(Clone, Debug)]
pub struct StateChanged {
    pub connection_id: String,
    pub old: ConnectionState,
    pub new: ConnectionState,
    pub reason: String,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct PerfStats {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_per_sec: f64,
    pub bytes_per_sec: f64,
}

#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub id: String,
    pub state: ConnectionState,
    pub stream_count: usize,
    pub heartbeat: HeartbeatStats,
    pub perf: PerfStats,
}

/// The generic `{stream, data}` envelope common to combined-stream endpoints, handed off
/// to the exchange's message parser once the byte count is recorded and the frame has
/// decoded as valid JSON.
#[derive(Clone, Debug)]
pub struct RawStreamMessage {
    pub connection_id: String,
    pub stream: String,
    pub data: Value,
    pub received_at: Instant,
    pub frame_len: usize,
}

#[derive(Deserialize)]
struct RawEnvelope {
    stream: String,
    data: Value,
}

/// Builds the exchange-documented JSON control frame for a subscribe/unsubscribe request.
/// Supplied by the exchange adapter so this module stays exchange-agnostic.
pub type FrameBuilder = Arc<dyn Fn(&[String], u64) -> Value + Send + Sync>;
/// Sink the connection hands every successfully decoded frame to.
pub type MessageSink = Arc<dyn Fn(RawStreamMessage) + Send + Sync>;

struct PerfWindow {
    stats: PerfStats,
    window_start: Instant,
    window_messages: u64,
    window_bytes: u64,
}

impl PerfWindow {
    fn new() -> Self {
        Self {
            stats: PerfStats::default(),
            window_start: Instant::now(),
            window_messages: 0,
            window_bytes: 0,
        }
    }

    fn record(&mut self, frame_len: usize) {
        self.stats.messages_received += 1;
        self.stats.bytes_received += frame_len as u64;
        self.window_messages += 1;
        self.window_bytes += frame_len as u64;

        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let secs = elapsed.as_secs_f64();
            self.stats.messages_per_sec = self.window_messages as f64 / secs;
            self.stats.bytes_per_sec = self.window_bytes as f64 / secs;
            self.window_start = Instant::now();
            self.window_messages = 0;
            self.window_bytes = 0;
        }
    }
}

struct Shared {
    state: Mutex<ConnectionState>,
    streams: Mutex<HashSet<String>>,
    perf: Mutex<PerfWindow>,
}

enum Command {
    Subscribe(Vec<String>, oneshot::Sender<Result<(), CoreError>>),
    Unsubscribe(Vec<String>, oneshot::Sender<Result<(), CoreError>>),
    Disconnect(String),
}

/// A single WebSocket connection carrying zero or more logical streams. Exactly one task
/// owns the socket; all other access goes through the
/// `command_tx` channel or the shared, lock-protected state/stats.
pub struct Connection {
    pub id: String,
    endpoint: String,
    max_streams: usize,
    heartbeat_config: HeartbeatConfig,
    shared: Arc<Shared>,
    heartbeat: Arc<HeartbeatController>,
    reconnect: Arc<ReconnectStrategy>,
    events: Emitter<StateChanged>,
    message_sink: MessageSink,
    subscribe_frame: FrameBuilder,
    unsubscribe_frame: FrameBuilder,
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    frame_seq: AtomicU64,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        endpoint: impl Into<String>,
        max_streams: usize,
        heartbeat_config: HeartbeatConfig,
        reconnect_config: ReconnectConfig,
        subscribe_frame: FrameBuilder,
        unsubscribe_frame: FrameBuilder,
        message_sink: MessageSink,
    ) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            max_streams,
            heartbeat_config,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Idle),
                streams: Mutex::new(HashSet::new()),
                perf: Mutex::new(PerfWindow::new()),
            }),
            heartbeat: Arc::new(HeartbeatController::new(heartbeat_config)),
            reconnect: Arc::new(ReconnectStrategy::new(reconnect_config)),
            events: Emitter::new(),
            message_sink,
            subscribe_frame,
            unsubscribe_frame,
            command_tx: Mutex::new(None),
            task: Mutex::new(None),
            frame_seq: AtomicU64::new(1),
        }
    }

    pub fn on_state_changed<F>(&self, listener: F) -> ListenerToken<StateChanged>
    where
        F: Fn(&StateChanged) + Send + Sync + 'static,
    {
        self.events.on(listener)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    fn transition(&self, new: ConnectionState, reason: impl Into<String>) {
        let old = {
            let mut state = self.shared.state.lock().unwrap();
            let old = *state;
            *state = new;
            old
        };
        if old != new {
            let reason = reason.into();
            debug!(connection_id = %self.id, ?old, ?new, %reason, "connection state transition");
            self.events.emit(StateChanged {
                connection_id: self.id.clone(),
                old,
                new,
                reason,
            });
        }
    }

    /// Establishes the WebSocket transport and spawns the frame-processing task. Transitions
    /// `IDLE -> CONNECTING -> CONNECTED -> ACTIVE` on success, `-> ERROR` on failure.
    pub async fn connect(self: &Arc<Self>) -> Result<(), CoreError> {
        self.transition(ConnectionState::Connecting, "connect requested");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.endpoint)
            .await
            .map_err(|err| {
                self.transition(ConnectionState::Error, format!("connect failed: {err}"));
                CoreError::from(err)
            })?;

        self.transition(ConnectionState::Connected, "transport established");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.command_tx.lock().unwrap() = Some(command_tx);

        let conn = Arc::clone(self);
        let handle = tokio::spawn(async move { conn.run_loop(ws_stream, command_rx).await });
        *self.task.lock().unwrap() = Some(handle);

        self.reconnect.mark_connected();
        self.transition(ConnectionState::Active, "ready to accept subscriptions");
        info!(connection_id = %self.id, endpoint = %self.endpoint, "connection active");
        Ok(())
    }

    async fn run_loop(
        self: Arc<Self>,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let (mut sink, mut stream) = ws_stream.split();
        let unsolicited_interval_duration = self
            .heartbeat_unsolicited_interval()
            .unwrap_or(Duration::from_secs(365 * 24 * 3600));
        let mut unsolicited_ticker = tokio::time::interval(unsolicited_interval_duration);
        let has_unsolicited = self.heartbeat_unsolicited_interval().is_some();
        let mut health_ticker = tokio::time::interval(self.heartbeat_check_interval());

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(names, reply)) => {
                            let seq = self.frame_seq.fetch_add(1, Ordering::SeqCst);
                            let frame = (self.subscribe_frame)(&names, seq);
                            let result = sink
                                .send(WsMessage::Text(frame.to_string()))
                                .await
                                .map_err(CoreError::from);
                            let _ = reply.send(result);
                        }
                        Some(Command::Unsubscribe(names, reply)) => {
                            let seq = self.frame_seq.fetch_add(1, Ordering::SeqCst);
                            let frame = (self.unsubscribe_frame)(&names, seq);
                            let result = sink
                                .send(WsMessage::Text(frame.to_string()))
                                .await
                                .map_err(CoreError::from);
                            let _ = reply.send(result);
                        }
                        Some(Command::Disconnect(reason)) => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            self.transition(ConnectionState::Disconnected, reason);
                            break;
                        }
                        None => break,
                    }
                }

                frame = stream.next() => {
                    let Some(frame) = frame else {
                        self.transition(ConnectionState::Disconnected, "stream ended");
                        break;
                    };
                    let ws_message = match frame {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(connection_id = %self.id, %err, "websocket read error");
                            self.transition(ConnectionState::Error, err.to_string());
                            break;
                        }
                    };

                    match ws_message {
                        WsMessage::Ping(payload) => {
                            let pong = self.heartbeat.handle_ping(payload);
                            if let Err(err) = sink.send(WsMessage::Pong(pong)).await {
                                warn!(connection_id = %self.id, %err, "failed to send pong");
                            }
                        }
                        WsMessage::Pong(_) => {}
                        WsMessage::Text(text) => self.handle_text_frame(text),
                        WsMessage::Binary(bytes) => {
                            warn!(connection_id = %self.id, len = bytes.len(), "unexpected binary frame");
                        }
                        WsMessage::Close(frame) => {
                            info!(connection_id = %self.id, ?frame, "peer closed connection");
                            self.transition(ConnectionState::Disconnected, "peer close frame");
                            break;
                        }
                        WsMessage::Frame(_) => {}
                    }
                }

                _ = health_ticker.tick() => {
                    if let Err(err) = self.heartbeat.check_timeout(Instant::now()) {
                        self.transition(ConnectionState::HeartbeatFailed, err.message.clone());
                        break;
                    }
                }

                _ = unsolicited_ticker.tick(), if has_unsolicited => {
                    if sink.send(WsMessage::Pong(Vec::new())).await.is_ok() {
                        self.heartbeat.record_unsolicited_pong();
                    }
                }
            }
        }
    }

    fn handle_text_frame(&self, text: String) {
        let frame_len = text.len();
        {
            let mut perf = self.shared.perf.lock().unwrap();
            perf.record(frame_len);
        }
        match serde_json::from_str::<RawEnvelope>(&text) {
            Ok(envelope) => {
                (self.message_sink)(RawStreamMessage {
                    connection_id: self.id.clone(),
                    stream: envelope.stream,
                    data: envelope.data,
                    received_at: Instant::now(),
                    frame_len,
                });
            }
            Err(err) => {
                warn!(connection_id = %self.id, %err, "dropping undecodable frame");
            }
        }
    }

    fn heartbeat_unsolicited_interval(&self) -> Option<Duration> {
        self.heartbeat_config.unsolicited_pong_interval
    }

    fn heartbeat_check_interval(&self) -> Duration {
        self.heartbeat_config.health_check_interval
    }

    /// Adds `names` to this connection's stream set, sending the subscribe control frame over
    /// the socket. Rejects the call if it would exceed `max_streams`.
    pub async fn subscribe(&self, names: Vec<String>) -> Result<(), CoreError> {
        if !self.can_accept_more_subscriptions(names.len()) {
            return Err(CoreError::subscription(format!(
                "connection {} cannot accept {} more streams (at {}/{})",
                self.id,
                names.len(),
                self.shared.streams.lock().unwrap().len(),
                self.max_streams
            )));
        }

        self.transition(ConnectionState::Subscribing, "subscribe in flight");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Subscribe(names.clone(), reply_tx))?;
        let result = reply_rx
            .await
            .map_err(|_| CoreError::connection("connection task terminated before reply"))?;

        if result.is_ok() {
            let mut streams = self.shared.streams.lock().unwrap();
            streams.extend(names);
        }
        self.transition(ConnectionState::Active, "subscribe completed");
        result
    }

    pub async fn unsubscribe(&self, names: Vec<String>) -> Result<(), CoreError> {
        self.transition(ConnectionState::Subscribing, "unsubscribe in flight");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::Unsubscribe(names.clone(), reply_tx))?;
        let result = reply_rx
            .await
            .map_err(|_| CoreError::connection("connection task terminated before reply"))?;

        if result.is_ok() {
            let mut streams = self.shared.streams.lock().unwrap();
            for name in &names {
                streams.remove(name);
            }
        }
        self.transition(ConnectionState::Active, "unsubscribe completed");
        result
    }

    fn send_command(&self, command: Command) -> Result<(), CoreError> {
        self.command_tx
            .lock()
            .unwrap()
            .as_ref()
            .ok_or_else(|| CoreError::connection("connection is not connected"))?
            .send(command)
            .map_err(|_| CoreError::connection("connection task is not running"))
    }

    /// Gracefully closes the socket. Idempotent: a connection already disconnecting or
    /// disconnected ignores a second call.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let current = self.state();
        if matches!(
            current,
            ConnectionState::Disconnecting
                | ConnectionState::Disconnected
                | ConnectionState::Terminated
        ) {
            return;
        }
        self.transition(ConnectionState::Disconnecting, reason.clone());
        let _ = self.send_command(Command::Disconnect(reason));
    }

    pub fn can_accept_more_subscriptions(&self, additional: usize) -> bool {
        self.shared.streams.lock().unwrap().len() + additional <= self.max_streams
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().unwrap().len()
    }

    pub fn health_score(&self) -> HealthScore {
        self.heartbeat.health_score()
    }

    pub fn get_stats(&self) -> ConnectionStats {
        ConnectionStats {
            id: self.id.clone(),
            state: self.state(),
            stream_count: self.stream_count(),
            heartbeat: self.heartbeat.stats(),
            perf: self.shared.perf.lock().unwrap().stats,
        }
    }

    pub fn reconnect_strategy(&self) -> &ReconnectStrategy {
        &self.reconnect
    }

    /// Asks the reconnect strategy for the next backoff delay; `None` means retries are
    /// exhausted and the connection must be torn down permanently.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), CoreError> {
        let Some(delay) = self.reconnect.next_attempt() else {
            self.transition(ConnectionState::Terminated, "reconnect attempts exhausted");
            return Err(CoreError::connection("reconnect attempts exhausted"));
        };
        self.transition(ConnectionState::Reconnecting, format!("retrying in {delay:?}"));
        tokio::time::sleep(delay).await;
        self.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConfig, ReconnectConfig};
    use std::sync::atomic::AtomicUsize;

    fn test_connection() -> Arc<Connection> {
        let received = Arc::new(AtomicUsize::new(0));
        let sink: MessageSink = Arc::new(move |_msg| {
            received.fetch_add(1, Ordering::SeqCst);
        });
        let subscribe: FrameBuilder = Arc::new(|names, id| {
            serde_json::json!({"method": "SUBSCRIBE", "params": names, "id": id})
        });
        let unsubscribe: FrameBuilder = Arc::new(|names, id| {
            serde_json::json!({"method": "UNSUBSCRIBE", "params": names, "id": id})
        });
        Arc::new(Connection::new(
            "conn-1",
            "wss://example.invalid/ws",
            5,
            HeartbeatConfig::default(),
            ReconnectConfig::default(),
            subscribe,
            unsubscribe,
            sink,
        ))
    }

    #[test]
    fn starts_idle_with_no_streams() {
        let conn = test_connection();
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.stream_count(), 0);
        assert!(conn.can_accept_more_subscriptions(5));
        assert!(!conn.can_accept_more_subscriptions(6));
    }

    #[test]
    fn disconnect_before_connect_is_a_harmless_no_op() {
        let conn = test_connection();
        conn.disconnect("shutting down");
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn second_disconnect_call_is_ignored() {
        let conn = test_connection();
        conn.disconnect("first");
        conn.disconnect("second");
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
    }

    #[test]
    fn state_change_listener_observes_transitions() {
        let conn = test_connection();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let _token = conn.on_state_changed(move |_event| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        conn.disconnect("test");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
