// =============================================================================
// WebSocket Client — authenticated stream with reconnect, heartbeat, refresh
// =============================================================================
//
// One client per channel group. The connection loop owns the current token
// and the live socket; frames flow through the decoder and normalizer into
// the tick channel in arrival order. Registered observers see raw
// open/frame/close events without ever owning the socket.
//
// Upstream tokens cannot be swapped on a live socket: when the refresh timer
// fires we acquire a fresh token, close with an internal code, and let the
// reconnect path attach it.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::clock::Clock;
use crate::normalize::{NormalizeError, Normalizer};
use crate::types::Tick;
use crate::upstream::auth::{AcquiredToken, TokenAcquirer};
use crate::upstream::frame::{DecodedFrame, FrameDecoder};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

/// Internal close code used when rotating tokens; distinguishes our own
/// rotation closes from upstream closes in the audit trail.
pub const TOKEN_ROTATION_CLOSE: u16 = 4001;

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
    Error,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// A clean (1000) close is terminal; anything else schedules a reconnect.
pub fn is_clean_close(code: u16) -> bool {
    code == 1000
}

/// Exponential backoff: `min(max, initial * multiplier^(attempt-1))`.
pub fn reconnect_delay(initial_ms: u64, max_ms: u64, multiplier: f64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let delay = (initial_ms as f64) * multiplier.powi(exp as i32);
    Duration::from_millis(delay.min(max_ms as f64) as u64)
}

// =============================================================================
// Observers
// =============================================================================

/// Borrowed view of one inbound frame, handed to observers before decoding.
#[derive(Debug, Clone, Copy)]
pub enum RawFrame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Non-invasive hook into the socket lifecycle. The lifecycle manager is the
/// production implementation; observers never own or mutate the socket.
pub trait StreamObserver: Send + Sync {
    fn on_open(&self, _group: &str) {}
    fn on_frame(&self, _frame: &RawFrame<'_>) {}
    fn on_close(&self, _code: u16) {}
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Base wss URL, e.g. `wss://host:port/stream`.
    pub stream_url: String,
    /// Channel CSV appended to the subscribe URL.
    pub channels: Vec<String>,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Refresh the token this long before expiry.
    pub refresh_margin_ms: i64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// None = retry forever.
    pub max_attempts: Option<u32>,
    /// Consecutive auth failures tolerated before FATAL_AUTH.
    pub auth_retry_limit: u32,
}

// =============================================================================
// Client
// =============================================================================

enum SessionEnd {
    Shutdown,
    ServerClose(u16),
    TokenRotation(AcquiredToken),
    Transport(String),
    Ended,
}

pub struct StreamClient {
    settings: StreamSettings,
    group: String,
    acquirer: TokenAcquirer,
    decoder: FrameDecoder,
    normalizer: Normalizer,
    ticks: mpsc::Sender<Tick>,
    observers: Vec<Arc<dyn StreamObserver>>,
    state: RwLock<ConnState>,
    shutdown: watch::Receiver<bool>,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl StreamClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: StreamSettings,
        group: impl Into<String>,
        acquirer: TokenAcquirer,
        decoder: FrameDecoder,
        normalizer: Normalizer,
        ticks: mpsc::Sender<Tick>,
        observers: Vec<Arc<dyn StreamObserver>>,
        shutdown: watch::Receiver<bool>,
        clock: Arc<dyn Clock>,
        audit: AuditSink,
    ) -> Self {
        Self {
            settings,
            group: group.into(),
            acquirer,
            decoder,
            normalizer,
            ticks,
            observers,
            state: RwLock::new(ConnState::Disconnected),
            shutdown,
            clock,
            audit,
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    fn set_state(&self, next: ConnState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(group = %self.group, from = %state, to = %next, "stream state");
            *state = next;
        }
    }

    /// Connection loop. Runs until a clean close, exhausted reconnects,
    /// fatal auth failure, or the stop signal; always lands in DISCONNECTED
    /// on the shutdown path.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.clone();
        let mut attempt: u32 = 0;
        let mut auth_failures: u32 = 0;
        let mut pending_token: Option<AcquiredToken> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnState::Connecting);
            self.audit.submit(
                AuditRecord::new("CONNECT_ATTEMPT", "stream")
                    .group(self.group.clone())
                    .field("attempt", serde_json::json!(attempt)),
            );

            // A token handed over by a rotation close is reused if it still
            // has life left; otherwise acquire fresh.
            let token_result = match pending_token.take() {
                Some(t) => {
                    self.acquirer
                        .refresh_if_needed(&t, self.settings.refresh_margin_ms)
                        .await
                }
                None => self.acquirer.acquire().await,
            };
            let token = match token_result {
                Ok(t) => {
                    auth_failures = 0;
                    t
                }
                Err(e) => {
                    auth_failures += 1;
                    warn!(group = %self.group, error = %e, auth_failures, "token acquisition failed");
                    self.audit.submit(
                        AuditRecord::new("AUTH_FAILED", "stream")
                            .group(self.group.clone())
                            .field("consecutive", serde_json::json!(auth_failures))
                            .field_str("error", e.to_string()),
                    );
                    if auth_failures >= self.settings.auth_retry_limit {
                        self.audit.submit(
                            AuditRecord::new("FATAL_AUTH", "stream")
                                .group(self.group.clone())
                                .field("consecutive", serde_json::json!(auth_failures)),
                        );
                        self.set_state(ConnState::Error);
                        anyhow::bail!(
                            "authentication failed {auth_failures} consecutive times: {e}"
                        );
                    }
                    self.set_state(ConnState::Error);
                    attempt += 1;
                    if self.exhausted(attempt) || !self.backoff(attempt, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let url = format!(
                "{}?channels={}&token={}",
                self.settings.stream_url,
                self.settings.channels.join(","),
                token.token
            );

            let connected =
                tokio::time::timeout(self.settings.connect_timeout, connect_async(url.as_str()))
                    .await;
            let ws = match connected {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    error!(group = %self.group, error = %e, "stream connect failed");
                    self.audit.submit(
                        AuditRecord::new("TRANSPORT_ERROR", "stream")
                            .group(self.group.clone())
                            .field_str("error", e.to_string()),
                    );
                    self.set_state(ConnState::Error);
                    attempt += 1;
                    if self.exhausted(attempt) || !self.backoff(attempt, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(_elapsed) => {
                    warn!(group = %self.group, "stream connect timed out");
                    self.audit.submit(
                        AuditRecord::new("CONNECT_TIMEOUT", "stream").group(self.group.clone()),
                    );
                    self.set_state(ConnState::Error);
                    attempt += 1;
                    if self.exhausted(attempt) || !self.backoff(attempt, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnState::Connected);
            attempt = 0;
            info!(group = %self.group, channels = ?self.settings.channels, "stream connected");
            self.audit.submit(
                AuditRecord::new("CONNECTED", "stream")
                    .group(self.group.clone())
                    .field_str("channels", self.settings.channels.join(",")),
            );
            for obs in &self.observers {
                obs.on_open(&self.group);
            }

            let end = self.session(ws, &token, &mut shutdown).await;

            let close_code = match &end {
                SessionEnd::Shutdown => 1000,
                SessionEnd::ServerClose(code) => *code,
                SessionEnd::TokenRotation(_) => TOKEN_ROTATION_CLOSE,
                SessionEnd::Transport(_) | SessionEnd::Ended => 1006,
            };
            for obs in &self.observers {
                obs.on_close(close_code);
            }

            match end {
                SessionEnd::Shutdown => {
                    self.audit
                        .submit(AuditRecord::new("DISCONNECTED", "stream").group(self.group.clone()));
                    break;
                }
                SessionEnd::TokenRotation(fresh) => {
                    pending_token = Some(fresh);
                    self.set_state(ConnState::Reconnecting);
                    continue;
                }
                SessionEnd::ServerClose(code) if is_clean_close(code) => {
                    info!(group = %self.group, "upstream closed cleanly");
                    self.audit.submit(
                        AuditRecord::new("CLOSED_CLEAN", "stream").group(self.group.clone()),
                    );
                    self.set_state(ConnState::Closed);
                    break;
                }
                SessionEnd::ServerClose(code) => {
                    warn!(group = %self.group, code, "unclean close");
                    self.audit.submit(
                        AuditRecord::new("CLOSE_UNCLEAN", "stream")
                            .group(self.group.clone())
                            .field("code", serde_json::json!(code)),
                    );
                    self.set_state(ConnState::Closed);
                    attempt += 1;
                    if self.exhausted(attempt) || !self.backoff(attempt, &mut shutdown).await {
                        break;
                    }
                }
                SessionEnd::Transport(err) => {
                    error!(group = %self.group, error = %err, "stream transport error");
                    self.audit.submit(
                        AuditRecord::new("TRANSPORT_ERROR", "stream")
                            .group(self.group.clone())
                            .field_str("error", err),
                    );
                    self.set_state(ConnState::Error);
                    attempt += 1;
                    if self.exhausted(attempt) || !self.backoff(attempt, &mut shutdown).await {
                        break;
                    }
                }
                SessionEnd::Ended => {
                    warn!(group = %self.group, "stream ended without close frame");
                    self.audit.submit(
                        AuditRecord::new("TRANSPORT_ERROR", "stream")
                            .group(self.group.clone())
                            .field_str("error", "stream ended"),
                    );
                    self.set_state(ConnState::Error);
                    attempt += 1;
                    if self.exhausted(attempt) || !self.backoff(attempt, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnState::Disconnected);
        Ok(())
    }

    fn exhausted(&self, attempt: u32) -> bool {
        match self.settings.max_attempts {
            Some(max) if attempt > max => {
                error!(group = %self.group, attempt, max, "reconnect attempts exhausted");
                self.audit.submit(
                    AuditRecord::new("RECONNECT_EXHAUSTED", "stream")
                        .group(self.group.clone())
                        .field("attempts", serde_json::json!(attempt)),
                );
                true
            }
            _ => false,
        }
    }

    /// Sleep the backoff delay; returns false when the stop signal fired.
    async fn backoff(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = reconnect_delay(
            self.settings.initial_delay_ms,
            self.settings.max_delay_ms,
            self.settings.multiplier,
            attempt,
        );
        self.audit.submit(
            AuditRecord::new("RECONNECT_SCHEDULED", "stream")
                .group(self.group.clone())
                .field("attempt", serde_json::json!(attempt))
                .field("delayMs", serde_json::json!(delay.as_millis() as u64)),
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = shutdown.changed() => changed.is_err() || !*shutdown.borrow(),
        }
    }

    // -------------------------------------------------------------------------
    // One connected session
    // -------------------------------------------------------------------------

    async fn session(
        &self,
        ws: WsStream,
        token: &AcquiredToken,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.heartbeat_interval,
            self.settings.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let refresh_in = (token.expires_at - self.settings.refresh_margin_ms
            - self.clock.now_ms())
        .max(0) as u64;
        self.audit.submit(
            AuditRecord::new("JWT_REFRESH_SCHEDULED", "stream")
                .group(self.group.clone())
                .field("inMs", serde_json::json!(refresh_in)),
        );
        let refresh = tokio::time::sleep(Duration::from_millis(refresh_in));
        tokio::pin!(refresh);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = write
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "shutdown".into(),
                            })))
                            .await;
                        return SessionEnd::Shutdown;
                    }
                }
                _ = heartbeat.tick() => {
                    let ping = serde_json::json!({
                        "type": "ping",
                        "timestamp": self.clock.now_ms(),
                    })
                    .to_string();
                    if let Err(e) = write.send(Message::Text(ping)).await {
                        return SessionEnd::Transport(format!("heartbeat send failed: {e}"));
                    }
                }
                _ = &mut refresh => {
                    match self.acquirer.acquire().await {
                        Ok(fresh) => {
                            self.audit.submit(
                                AuditRecord::new("JWT_REFRESHED", "stream")
                                    .group(self.group.clone()),
                            );
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::from(TOKEN_ROTATION_CLOSE),
                                    reason: "token rotation".into(),
                                })))
                                .await;
                            return SessionEnd::TokenRotation(fresh);
                        }
                        Err(e) => {
                            return SessionEnd::Transport(format!("token refresh failed: {e}"));
                        }
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(message)) => {
                        if let Some(end) = self.handle_message(message, &mut write).await {
                            return end;
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                    None => return SessionEnd::Ended,
                },
            }
        }
    }

    /// Returns Some when the message terminates the session.
    async fn handle_message(&self, message: Message, write: &mut WsSink) -> Option<SessionEnd> {
        match message {
            Message::Text(text) => {
                for obs in &self.observers {
                    obs.on_frame(&RawFrame::Text(&text));
                }
                let decoded = self.decoder.decode_text(&text);
                self.route(decoded).await;
                None
            }
            Message::Binary(data) => {
                for obs in &self.observers {
                    obs.on_frame(&RawFrame::Binary(&data));
                }
                let decoded = self.decoder.decode_binary(&data);
                self.route(decoded).await;
                None
            }
            Message::Ping(payload) => {
                if let Err(e) = write.send(Message::Pong(payload)).await {
                    return Some(SessionEnd::Transport(format!("pong send failed: {e}")));
                }
                None
            }
            Message::Pong(_) => None,
            Message::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(1005);
                Some(SessionEnd::ServerClose(code))
            }
            Message::Frame(_) => None,
        }
    }

    async fn route(&self, decoded: DecodedFrame) {
        match decoded {
            DecodedFrame::KeepAlive | DecodedFrame::Heartbeat | DecodedFrame::Unknown { .. } => {}
            DecodedFrame::Json(value) => {
                let tag = format!("json/{}", self.group);
                match value {
                    serde_json::Value::Array(items) => {
                        for item in &items {
                            self.push_json(item, &tag).await;
                        }
                    }
                    other => self.push_json(&other, &tag).await,
                }
            }
            DecodedFrame::Xml(xml) => {
                let tag = format!("xml/{}", self.group);
                match self.normalizer.from_xml(&xml, &tag) {
                    Ok(ticks) => {
                        for tick in ticks {
                            self.push(tick).await;
                        }
                    }
                    Err(e) => {
                        self.audit.submit(
                            AuditRecord::new("NORMALIZE_FAILED", "stream")
                                .group(self.group.clone())
                                .field_str("error", e.to_string()),
                        );
                    }
                }
            }
        }
    }

    async fn push_json(&self, value: &serde_json::Value, tag: &str) {
        match self.normalizer.from_json(value, tag) {
            Ok(tick) => self.push(tick).await,
            // Zero-baseline drops are audited inside the normalizer.
            Err(NormalizeError::ZeroBaseline(_)) => {}
            Err(e) => {
                self.audit.submit(
                    AuditRecord::new("NORMALIZE_FAILED", "stream")
                        .group(self.group.clone())
                        .field_str("error", e.to_string()),
                );
            }
        }
    }

    async fn push(&self, tick: Tick) {
        if self.ticks.send(tick).await.is_err() {
            // Pipeline is gone; only happens during shutdown.
            debug!(group = %self.group, "tick pipeline closed, dropping tick");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn stop_signal_lands_in_disconnected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at(0));
        let audit = AuditSink::disabled(clock.clone());
        let acquirer = TokenAcquirer::new(
            "https://auth.invalid/getwebsockettoken",
            "https://origin.invalid",
            "https://referer.invalid",
            "test-agent",
            60_000,
            clock.clone(),
            audit.clone(),
        )
        .unwrap();
        let settings = StreamSettings {
            stream_url: "wss://stream.invalid/stream".into(),
            channels: vec!["change_xml".into()],
            connect_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            refresh_margin_ms: 5_000,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            multiplier: 2.0,
            max_attempts: Some(1),
            auth_retry_limit: 1,
        };
        let (tick_tx, _tick_rx) = mpsc::channel(8);
        // Stop signal already raised: run() must return without connecting
        // and settle in DISCONNECTED with no timers armed.
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        let client = StreamClient::new(
            settings,
            "test",
            acquirer,
            FrameDecoder::new(audit.clone()),
            Normalizer::new(clock.clone(), audit.clone()),
            tick_tx,
            Vec::new(),
            shutdown_rx,
            clock,
            audit,
        );

        client.run().await.unwrap();
        assert_eq!(client.state(), ConnState::Disconnected);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        // Scenario 5: 1 s, 2 s, 4 s, ... capped at 60 s.
        assert_eq!(reconnect_delay(1_000, 60_000, 2.0, 1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1_000, 60_000, 2.0, 2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(1_000, 60_000, 2.0, 3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(1_000, 60_000, 2.0, 7), Duration::from_secs(64).min(Duration::from_secs(60)));
        assert_eq!(reconnect_delay(1_000, 60_000, 2.0, 30), Duration::from_secs(60));
    }

    #[test]
    fn backoff_exponent_does_not_overflow() {
        let delay = reconnect_delay(1_000, 60_000, 2.0, u32::MAX);
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn close_code_1000_is_clean_1001_is_not() {
        assert!(is_clean_close(1000));
        assert!(!is_clean_close(1001));
        assert!(!is_clean_close(1006));
        assert!(!is_clean_close(TOKEN_ROTATION_CLOSE));
    }

    #[test]
    fn conn_state_display_is_screaming() {
        assert_eq!(ConnState::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(ConnState::Reconnecting.to_string(), "RECONNECTING");
    }
}
