//! Authenticated reconnecting WebSocket transport.
//!
//! The transport runs its own state machine on a background task and
//! talks to callers through two channels: a command sender the caller
//! holds ([`Transport`]) and an event receiver the caller drains. This
//! keeps every mutation of connection state on one task, matching the
//! single-executor model the rest of the engine assumes.

pub mod auth;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::app::Credentials;
use crate::error::{classify_auth_failure, classify_close_code, Error, ErrorKind, Result};
use crate::time::skewed_expires;

use self::auth::{auth_message, realtime_signature};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Closing,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Close { code: u16, reason: String },
    Error(String),
    Message(String),
    Authed { ts: i64 },
    AuthError(String),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub send_buffer_limit: usize,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub auth_timeout: Duration,
    pub auth_expires_skew_sec: i64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "wss://www.bitmex.com/realtime".to_string(),
            send_buffer_limit: 1024,
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(10),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            auth_timeout: Duration::from_secs(1),
            auth_expires_skew_sec: 60,
        }
    }
}

/// `min(maxDelay, baseDelay * 2^(attempt-1))`, `attempt` is
/// 1-based.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let scaled = base.as_millis().saturating_mul(factor as u128);
    Duration::from_millis(scaled.min(max.as_millis()) as u64)
}

/// Bounded FIFO of outbound frames queued before the socket is open.
struct SendBuffer {
    limit: usize,
    rows: VecDeque<String>,
    shared_len: Arc<AtomicUsize>,
}

impl SendBuffer {
    fn new(limit: usize, shared_len: Arc<AtomicUsize>) -> Self {
        Self {
            limit,
            rows: VecDeque::new(),
            shared_len,
        }
    }

    fn push(&mut self, raw: String) -> Result<()> {
        if self.rows.len() >= self.limit {
            return Err(Error::validation("send buffer overflow"));
        }
        self.rows.push_back(raw);
        self.shared_len.store(self.rows.len(), Ordering::Relaxed);
        Ok(())
    }

    fn drain(&mut self) -> std::vec::Drain<'_, String> {
        self.shared_len.store(0, Ordering::Relaxed);
        self.rows.drain(..)
    }
}

enum Command {
    Connect,
    Login(Credentials),
    Send(String),
    Disconnect { graceful: bool },
}

/// Caller-facing handle. Cloneable; every clone shares the same
/// background worker and send buffer.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::UnboundedSender<Command>,
    buffer_limit: usize,
    buffer_len: Arc<AtomicUsize>,
}

impl Transport {
    /// Spawns the background worker and returns the handle plus the
    /// event stream the caller is expected to drain.
    pub fn spawn(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let buffer_len = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            config: config.clone(),
            cmd_rx,
            event_tx,
            send_buffer: SendBuffer::new(config.send_buffer_limit, buffer_len.clone()),
            conn_state: ConnState::Idle,
            attempt: 0,
            credentials: None,
            auto_relogin_disabled: false,
            manual_disconnect: false,
        };
        tokio::spawn(worker.run());
        (
            Self {
                cmd_tx,
                buffer_limit: config.send_buffer_limit,
                buffer_len,
            },
            event_rx,
        )
    }

    fn dispatch(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::network("transport worker has stopped"))
    }

    pub fn connect(&self) -> Result<()> {
        self.dispatch(Command::Connect)
    }

    pub fn login(&self, credentials: Credentials) -> Result<()> {
        self.dispatch(Command::Login(credentials))
    }

    /// Enqueues a frame. Fails synchronously with `Validation` if the
    /// send buffer is already at capacity.
    pub fn send(&self, raw: String) -> Result<()> {
        if self.buffer_len.load(Ordering::Relaxed) >= self.buffer_limit {
            return Err(Error::validation("send buffer overflow"));
        }
        self.dispatch(Command::Send(raw))
    }

    pub fn disconnect(&self, graceful: bool) -> Result<()> {
        self.dispatch(Command::Disconnect { graceful })
    }
}

struct Worker {
    config: TransportConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    send_buffer: SendBuffer,
    conn_state: ConnState,
    attempt: u32,
    credentials: Option<Credentials>,
    auto_relogin_disabled: bool,
    manual_disconnect: bool,
}

impl Worker {
    fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn run(mut self) {
        loop {
            match self.conn_state {
                ConnState::Idle => {
                    let Some(cmd) = self.cmd_rx.recv().await else {
                        return;
                    };
                    self.handle_idle_command(cmd).await;
                }
                ConnState::Connecting | ConnState::Reconnecting => {
                    self.connect_and_run().await;
                }
                ConnState::Open | ConnState::Closing => {
                    // Reached only if connect_and_run returned without
                    // resetting state; treat as a stray transition back
                    // to idle to avoid spinning.
                    self.conn_state = ConnState::Idle;
                }
            }
        }
    }

    async fn handle_idle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                self.manual_disconnect = false;
                self.conn_state = ConnState::Connecting;
            }
            Command::Login(creds) => {
                self.credentials = Some(creds);
            }
            Command::Send(raw) => {
                if let Err(e) = self.send_buffer.push(raw) {
                    self.emit(TransportEvent::Error(e.message));
                }
            }
            Command::Disconnect { .. } => {}
        }
    }

    /// Attempts one connection, then drives it until it closes, then
    /// either schedules a reconnect or returns to `Idle`.
    async fn connect_and_run(&mut self) {
        if self.attempt > 0 {
            let delay = backoff_delay(self.config.base_delay, self.config.max_delay, self.attempt);
            info!(attempt = self.attempt, delay_ms = delay.as_millis(), "reconnecting after backoff");
            tokio::select! {
                _ = sleep(delay) => {}
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Disconnect { .. }) | None => {
                            self.manual_disconnect = true;
                            self.conn_state = ConnState::Idle;
                            return;
                        }
                        Some(other) => self.handle_idle_command(other).await,
                    }
                }
            }
        }

        if self.attempt >= self.config.max_attempts {
            error!(attempts = self.attempt, "giving up reconnecting, max attempts exceeded");
            self.emit(TransportEvent::Error("max reconnect attempts exceeded".into()));
            self.conn_state = ConnState::Idle;
            return;
        }

        let ws = match connect_async(&self.config.url).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                self.attempt += 1;
                warn!(error = %e, attempt = self.attempt, "connect failed");
                self.emit(TransportEvent::Error(e.to_string()));
                self.conn_state = ConnState::Reconnecting;
                return;
            }
        };

        info!("websocket connected");
        self.attempt = 0;
        self.conn_state = ConnState::Open;
        self.emit(TransportEvent::Open);

        if let Some(creds) = self.credentials.clone() {
            if !self.auto_relogin_disabled {
                self.send_buffer_auth(&creds);
            }
        }

        let outcome = self.drive_open_connection(ws).await;
        match outcome {
            SessionEnd::Manual => {
                self.conn_state = ConnState::Idle;
            }
            SessionEnd::Terminal { code, reason } => {
                self.emit(TransportEvent::Close { code, reason });
                self.conn_state = ConnState::Idle;
            }
            SessionEnd::Abnormal { code, reason } => {
                self.emit(TransportEvent::Close { code, reason });
                self.attempt = 1;
                self.conn_state = ConnState::Reconnecting;
            }
        }
    }

    /// Queues the `authKeyExpires` handshake frame; the actual send
    /// happens via the normal buffered-send path so it respects FIFO
    /// ordering with any caller traffic queued before `open`.
    fn send_buffer_auth(&mut self, creds: &Credentials) {
        let expires = skewed_expires(self.config.auth_expires_skew_sec);
        let signature = realtime_signature(&creds.api_secret, expires);
        let msg = auth_message(&creds.api_key, expires, &signature);
        if let Err(e) = self.send_buffer.push(msg.to_string()) {
            self.emit(TransportEvent::AuthError(e.message));
        }
    }

    async fn drive_open_connection(&mut self, mut ws: WsStream) -> SessionEnd {
        let mut pong_deadline = Instant::now() + self.config.pong_timeout;
        let mut ping_due = Instant::now() + self.config.ping_interval;

        // Flush anything queued before open, in FIFO order. A failure
        // mid-flush retains the remaining tail for the next attempt.
        let queued: Vec<String> = self.send_buffer.drain().collect();
        for raw in queued {
            if let Err(e) = ws.send(Message::Text(raw.clone())).await {
                warn!(error = %e, "send failed mid-flush, re-buffering remainder");
                let _ = self.send_buffer.push(raw);
                return SessionEnd::Abnormal {
                    code: 1006,
                    reason: e.to_string(),
                };
            }
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => return SessionEnd::Manual,
                        Some(Command::Disconnect { graceful }) => {
                            self.manual_disconnect = true;
                            let frame = graceful.then(|| CloseFrame {
                                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                                reason: "manual disconnect".into(),
                            });
                            let _ = ws.close(frame).await;
                            return SessionEnd::Manual;
                        }
                        Some(Command::Connect) => {}
                        Some(Command::Login(creds)) => {
                            self.credentials = Some(creds.clone());
                            self.auto_relogin_disabled = false;
                            self.send_buffer_auth(&creds);
                            if let Some(raw) = self.send_buffer.drain().next() {
                                if ws.send(Message::Text(raw)).await.is_err() {
                                    return SessionEnd::Abnormal { code: 1006, reason: "send failed".into() };
                                }
                            }
                        }
                        Some(Command::Send(raw)) => {
                            if ws.send(Message::Text(raw)).await.is_err() {
                                return SessionEnd::Abnormal { code: 1006, reason: "send failed".into() };
                            }
                        }
                    }
                }
                _ = sleep_until(ping_due) => {
                    if ws.send(Message::Ping(Vec::new())).await.is_err() {
                        return SessionEnd::Abnormal { code: 1006, reason: "ping send failed".into() };
                    }
                    ping_due = Instant::now() + self.config.ping_interval;
                }
                _ = sleep_until(pong_deadline) => {
                    warn!("pong timeout, treating as abnormal close");
                    return SessionEnd::Abnormal { code: 1006, reason: "pong timeout".into() };
                }
                frame = ws.next() => {
                    match frame {
                        None => return SessionEnd::Abnormal { code: 1006, reason: "stream ended".into() },
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_frame(&text);
                        }
                        Some(Ok(Message::Pong(_))) => {
                            pong_deadline = Instant::now() + self.config.pong_timeout;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1005, String::new()));
                            if code == 1000 {
                                return SessionEnd::Terminal { code, reason };
                            }
                            return SessionEnd::Abnormal { code, reason };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let classified: Error = e.into();
                            debug!(error = %classified, "stream error");
                            return SessionEnd::Abnormal { code: 1006, reason: classified.message };
                        }
                    }
                }
            }
        }
    }

    fn handle_text_frame(&mut self, text: &str) {
        let parsed: Option<Value> = serde_json::from_str(text).ok();
        if let Some(value) = &parsed {
            if value.get("request").and_then(|r| r.get("op")).and_then(|o| o.as_str())
                == Some("authKeyExpires")
            {
                let success = value.get("success").and_then(|s| s.as_bool()).unwrap_or(false);
                if success {
                    self.emit(TransportEvent::Authed {
                        ts: crate::time::now_ms(),
                    });
                } else {
                    let message = value
                        .get("error")
                        .or_else(|| value.get("message"))
                        .and_then(|m| m.as_str())
                        .unwrap_or("auth denied");
                    let kind = classify_auth_failure(message);
                    if matches!(kind, ErrorKind::BadCredentials | ErrorKind::ClockSkew) {
                        warn!(%kind, "auth failure disables auto-relogin until credentials change");
                        self.auto_relogin_disabled = true;
                    }
                    self.emit(TransportEvent::AuthError(message.to_string()));
                }
                return;
            }
        }
        self.emit(TransportEvent::Message(text.to_string()));
    }
}

async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
}

enum SessionEnd {
    Manual,
    Terminal { code: u16, reason: String },
    Abnormal { code: u16, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, max, 10), max);
    }

    #[test]
    fn send_buffer_overflows_with_validation_error() {
        let mut buf = SendBuffer::new(2, Arc::new(AtomicUsize::new(0)));
        buf.push("a".into()).unwrap();
        buf.push("b".into()).unwrap();
        let err = buf.push("c".into()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn send_buffer_drains_in_fifo_order() {
        let mut buf = SendBuffer::new(10, Arc::new(AtomicUsize::new(0)));
        buf.push("a".into()).unwrap();
        buf.push("b".into()).unwrap();
        let drained: Vec<String> = buf.drain().collect();
        assert_eq!(drained, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn close_code_1000_is_terminal_not_reconnect() {
        assert!(classify_close_code(1000).is_none());
        assert!(classify_close_code(1006).is_some());
    }
}
