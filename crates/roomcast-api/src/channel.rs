//! Realtime event channel with auto-reconnect.
//!
//! Maintains one logical WebSocket connection to the platform's push
//! endpoint. The bearer token is presented on the upgrade request;
//! room subscriptions are retained client-side and replayed on every
//! successful (re)connect; inbound events fan out through a
//! [`tokio::sync::broadcast`] channel. Unexpected drops reconnect with
//! exponential backoff + jitter up to a configured attempt ceiling.
//!
//! A handshake rejection (401/403 on upgrade) is not a transient
//! failure: the loop stops immediately in a terminal auth-failure phase
//! and the caller must obtain a fresh token before reconnecting.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::Error;
use crate::token::Token;

// ── Broadcast channel capacity ───────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── PushEvent ────────────────────────────────────────────────────────

/// A named event pushed by the platform.
///
/// Transient: consumed once by the dispatcher and discarded. The server
/// provides no dedup key, so redelivery after a reconnect is possible
/// and handlers must be idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    /// Event name, e.g. `"device:offline"`, `"pms:guest-checkin"`.
    pub name: String,

    /// Opaque JSON payload; shape depends on the event name.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Client-side arrival timestamp.
    pub received_at: DateTime<Utc>,
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for channel reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Reconnection attempts before the channel gives up and enters
    /// [`ChannelPhase::Failed`]. Default: 10.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

// ── Phase ────────────────────────────────────────────────────────────

/// Observable connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Terminal until [`RealtimeChannel::connect`] is called again.
    Failed(ChannelFailure),
}

/// Why the channel gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelFailure {
    /// The server rejected the handshake token. Retrying the same
    /// credential is never correct.
    AuthRejected,
    /// The backoff schedule was exhausted without a successful connect.
    AttemptsExhausted,
}

// ── Wire frames ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ControlFrame<'a> {
    action: &'a str,
    room: &'a str,
}

// ── RealtimeChannel ──────────────────────────────────────────────────

/// Handle to the realtime event channel.
///
/// Cheaply cloneable; one logical connection per channel regardless of
/// clone count. The channel never reads the token store itself -- the
/// credential is handed in through [`connect`](Self::connect) (by the
/// session/channel bridge in roomcast-core).
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    ws_url: Url,
    reconnect: ReconnectConfig,
    phase_tx: watch::Sender<ChannelPhase>,
    event_tx: broadcast::Sender<Arc<PushEvent>>,
    /// Rooms to be subscribed; replayed in full on every (re)connect.
    subscriptions: Mutex<BTreeSet<String>>,
    /// Outbound lane into the live connection, present only while
    /// a connection is established.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    run: Mutex<Option<ChannelRun>>,
}

struct ChannelRun {
    token: Token,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RealtimeChannel {
    /// Create a disconnected channel for `ws_url`.
    pub fn new(ws_url: Url, reconnect: ReconnectConfig) -> Self {
        let (phase_tx, _) = watch::channel(ChannelPhase::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(ChannelInner {
                ws_url,
                reconnect,
                phase_tx,
                event_tx,
                subscriptions: Mutex::new(BTreeSet::new()),
                outbound: Mutex::new(None),
                run: Mutex::new(None),
            }),
        }
    }

    /// Derive the event endpoint (`wss://…/ws/events`) from the
    /// platform's HTTP base URL.
    pub fn event_endpoint(base: &Url) -> Result<Url, Error> {
        let mut url = base.join("ws/events")?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(Error::WebSocketConnect(format!(
                    "unsupported scheme: {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| Error::WebSocketConnect("could not set ws scheme".into()))?;
        Ok(url)
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Open (or re-key) the channel with `token`.
    ///
    /// Idempotent while already Connecting/Connected/Reconnecting with
    /// the same token. A different token while active tears the current
    /// connection down and reconnects -- never an in-place credential
    /// swap. After `Failed`, calling `connect` starts a fresh attempt
    /// cycle.
    pub async fn connect(&self, token: Token) {
        let mut run = self.inner.run.lock().await;

        if let Some(existing) = run.as_ref() {
            let active = matches!(
                *self.inner.phase_tx.borrow(),
                ChannelPhase::Connecting
                    | ChannelPhase::Connected
                    | ChannelPhase::Reconnecting { .. }
            );
            if active && existing.token == token {
                debug!("connect: channel already active with this token");
                return;
            }
        }

        if let Some(old) = run.take() {
            debug!("connect: replacing existing channel connection");
            old.cancel.cancel();
            let _ = old.handle.await;
        }

        let _ = self.inner.phase_tx.send(ChannelPhase::Connecting);

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(channel_loop(inner, token.clone(), cancel.clone()));

        *run = Some(ChannelRun {
            token,
            cancel,
            handle,
        });
    }

    /// Close the channel and clear the subscription set. Never fails.
    pub async fn disconnect(&self) {
        let mut run = self.inner.run.lock().await;
        if let Some(old) = run.take() {
            old.cancel.cancel();
            let _ = old.handle.await;
        }

        self.inner.subscriptions.lock().await.clear();
        *self.inner.outbound.lock().await = None;
        let _ = self.inner.phase_tx.send(ChannelPhase::Disconnected);
        debug!("channel disconnected");
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Add `room` to the subscription set.
    ///
    /// If connected, the subscribe control frame is sent immediately;
    /// otherwise membership is retained and replayed on the next
    /// successful connect.
    pub async fn subscribe(&self, room: impl Into<String>) {
        let room = room.into();
        let newly_added = self.inner.subscriptions.lock().await.insert(room.clone());
        if newly_added {
            self.send_control("subscribe", &room).await;
        }
    }

    /// Remove `room` from the subscription set, notifying the server if
    /// connected.
    pub async fn unsubscribe(&self, room: &str) {
        let removed = self.inner.subscriptions.lock().await.remove(room);
        if removed {
            self.send_control("unsubscribe", room).await;
        }
    }

    /// Snapshot of the retained room set.
    pub async fn subscribed_rooms(&self) -> Vec<String> {
        self.inner.subscriptions.lock().await.iter().cloned().collect()
    }

    async fn send_control(&self, action: &str, room: &str) {
        let outbound = self.inner.outbound.lock().await;
        let Some(tx) = outbound.as_ref() else { return };

        match serde_json::to_string(&ControlFrame { action, room }) {
            Ok(frame) => {
                debug!(action, room, "sending control frame");
                let _ = tx.send(frame);
            }
            Err(e) => warn!(error = %e, action, room, "could not encode control frame"),
        }
    }

    // ── State observation ────────────────────────────────────────────

    /// Subscribe to phase transitions.
    pub fn phase(&self) -> watch::Receiver<ChannelPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// The current phase snapshot.
    pub fn current_phase(&self) -> ChannelPhase {
        *self.inner.phase_tx.borrow()
    }

    /// Get a new broadcast receiver for the inbound event stream.
    ///
    /// Multiple consumers can subscribe concurrently. A consumer that
    /// falls behind receives [`broadcast::error::RecvError::Lagged`].
    pub fn events(&self) -> broadcast::Receiver<Arc<PushEvent>> {
        self.inner.event_tx.subscribe()
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Main loop: connect → read/write → on drop, backoff → reconnect.
///
/// `attempt` resets to 0 each time the connection is established, so the
/// ceiling applies to *consecutive* failures only.
async fn channel_loop(inner: Arc<ChannelInner>, token: Token, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        match run_connection(&inner, &token, &cancel, &mut attempt).await {
            ConnectionEnd::Cancelled => {
                let _ = inner.phase_tx.send(ChannelPhase::Disconnected);
                break;
            }
            ConnectionEnd::AuthRejected(message) => {
                // Not a backoff-eligible failure: the token is bad and
                // only the session can mint a new one.
                warn!(%message, "channel handshake rejected; not retrying");
                let _ = inner
                    .phase_tx
                    .send(ChannelPhase::Failed(ChannelFailure::AuthRejected));
                break;
            }
            ConnectionEnd::Dropped(reason) => {
                attempt += 1;
                if attempt > inner.reconnect.max_attempts {
                    error!(
                        max_attempts = inner.reconnect.max_attempts,
                        "reconnect attempts exhausted, giving up"
                    );
                    let _ = inner
                        .phase_tx
                        .send(ChannelPhase::Failed(ChannelFailure::AttemptsExhausted));
                    break;
                }

                warn!(reason = %reason, attempt, "channel dropped; scheduling reconnect");
                let _ = inner
                    .phase_tx
                    .send(ChannelPhase::Reconnecting { attempt });

                let delay = backoff_delay(attempt - 1, &inner.reconnect);
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    attempt, "waiting before reconnect"
                );

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = inner.phase_tx.send(ChannelPhase::Disconnected);
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    *inner.outbound.lock().await = None;
    debug!("channel loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

enum ConnectionEnd {
    Cancelled,
    AuthRejected(String),
    Dropped(String),
}

/// Establish one connection, replay subscriptions, then pump frames
/// until the connection drops or the loop is cancelled.
async fn run_connection(
    inner: &ChannelInner,
    token: &Token,
    cancel: &CancellationToken,
    attempt: &mut u32,
) -> ConnectionEnd {
    debug!(url = %inner.ws_url, "connecting to event channel");

    let uri: tungstenite::http::Uri = match inner.ws_url.as_str().parse() {
        Ok(uri) => uri,
        Err(e) => return ConnectionEnd::Dropped(format!("invalid ws uri: {e}")),
    };

    let request = ClientRequestBuilder::new(uri)
        .with_header("Authorization", format!("Bearer {}", token.as_str()));

    let ws_stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return ConnectionEnd::Cancelled,
        result = tokio_tungstenite::connect_async(request) => match result {
            Ok((stream, _response)) => stream,
            Err(tungstenite::Error::Http(resp))
                if resp.status() == StatusCode::UNAUTHORIZED
                    || resp.status() == StatusCode::FORBIDDEN =>
            {
                return ConnectionEnd::AuthRejected(format!("HTTP {}", resp.status()));
            }
            Err(e) => return ConnectionEnd::Dropped(e.to_string()),
        }
    };

    info!("event channel connected");
    let _ = inner.phase_tx.send(ChannelPhase::Connected);
    *attempt = 0;

    let (mut write, mut read) = ws_stream.split();

    // Register the outbound lane before replaying so subscribe() calls
    // racing the reconnect are not silently lost.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    *inner.outbound.lock().await = Some(out_tx);

    let end = pump_frames(inner, &mut write, &mut read, &mut out_rx, cancel).await;

    *inner.outbound.lock().await = None;
    end
}

async fn pump_frames(
    inner: &ChannelInner,
    write: &mut SplitSink<WsStream, Message>,
    read: &mut SplitStream<WsStream>,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> ConnectionEnd {
    // Replay the retained room set; the server keeps no subscription
    // state across connections from our point of view.
    let rooms: Vec<String> = inner.subscriptions.lock().await.iter().cloned().collect();
    for room in &rooms {
        match serde_json::to_string(&ControlFrame {
            action: "subscribe",
            room: room.as_str(),
        }) {
            Ok(frame) => {
                if let Err(e) = write.send(Message::text(frame)).await {
                    return ConnectionEnd::Dropped(format!("subscription replay failed: {e}"));
                }
                debug!(room = %room, "room subscription replayed");
            }
            Err(e) => warn!(error = %e, room = %room, "could not encode subscribe frame"),
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ConnectionEnd::Cancelled,
            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    return ConnectionEnd::Dropped("outbound lane closed".into());
                };
                if let Err(e) = write.send(Message::text(frame)).await {
                    return ConnectionEnd::Dropped(e.to_string());
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        parse_and_broadcast(text.as_str(), &inner.event_tx);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite handles pong replies automatically
                        trace!("channel ping");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            info!(code = %cf.code, reason = %cf.reason, "server close frame");
                        } else {
                            info!("server close frame (no payload)");
                        }
                        return ConnectionEnd::Dropped("server closed the connection".into());
                    }
                    Some(Err(e)) => return ConnectionEnd::Dropped(e.to_string()),
                    None => return ConnectionEnd::Dropped("stream ended".into()),
                    Some(Ok(_)) => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }
}

// ── Message parsing ──────────────────────────────────────────────────

/// Parse a text frame and broadcast the event inside, if any.
fn parse_and_broadcast(text: &str, event_tx: &broadcast::Sender<Arc<PushEvent>>) {
    let frame: EventFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "failed to parse event frame");
            return;
        }
    };

    let event = PushEvent {
        name: frame.event,
        payload: frame.payload,
        received_at: Utc::now(),
    };

    // Ignore send errors -- just means no active subscribers right now
    let _ = event_tx.send(Arc::new(event));
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Delay before reconnect `attempt` (zero-based): doubles from
/// `initial_delay`, capped at `max_delay`, then spread by +-25% so a
/// fleet of consoles does not hammer a restarting platform in lockstep.
/// The spread is derived from the attempt number, keeping the schedule
/// reproducible in tests.
fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let doubled = config.initial_delay.as_secs_f64() * f64::from(2_u32.pow(attempt.min(16)));
    let capped = doubled.min(config.max_delay.as_secs_f64());

    let spread = 0.25 * (f64::from(attempt) * 7.3).sin();
    Duration::from_secs_f64(capped * (1.0 + spread))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn backoff_schedule_grows_until_the_cap() {
        let config = ReconnectConfig::default();

        // Doubling outpaces the +-25% spread, so the early schedule is
        // strictly increasing.
        let schedule: Vec<Duration> = (0..5).map(|a| backoff_delay(a, &config)).collect();
        for pair in schedule.windows(2) {
            assert!(
                pair[1] > pair[0],
                "schedule should grow before the cap: {schedule:?}"
            );
        }
    }

    #[test]
    fn backoff_stays_under_cap_plus_spread() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: 12,
        };

        let ceiling = Duration::from_secs_f64(8.0 * 1.25);
        for attempt in 0..config.max_attempts {
            let delay = backoff_delay(attempt, &config);
            assert!(
                delay <= ceiling,
                "attempt {attempt} delay {delay:?} exceeds {ceiling:?}"
            );
        }
    }

    #[test]
    fn backoff_is_reproducible() {
        let config = ReconnectConfig::default();
        for attempt in [0, 3, 7] {
            assert_eq!(backoff_delay(attempt, &config), backoff_delay(attempt, &config));
        }
    }

    #[test]
    fn event_endpoint_from_https_base() {
        let base = Url::parse("https://panel.hotel.test/").expect("valid url");
        let ws = RealtimeChannel::event_endpoint(&base).expect("endpoint");
        assert_eq!(ws.as_str(), "wss://panel.hotel.test/ws/events");
    }

    #[test]
    fn event_endpoint_from_http_base() {
        let base = Url::parse("http://127.0.0.1:8080/").expect("valid url");
        let ws = RealtimeChannel::event_endpoint(&base).expect("endpoint");
        assert_eq!(ws.as_str(), "ws://127.0.0.1:8080/ws/events");
    }

    #[test]
    fn parse_event_frame() {
        let (tx, mut rx) = broadcast::channel(16);

        let raw = serde_json::json!({
            "event": "device:offline",
            "payload": { "uuid": "c0ffee", "room": "412" }
        });

        parse_and_broadcast(&raw.to_string(), &tx);

        let event = rx.try_recv().expect("event should be broadcast");
        assert_eq!(event.name, "device:offline");
        assert_eq!(event.payload["room"], "412");
    }

    #[test]
    fn parse_frame_without_payload() {
        let (tx, mut rx) = broadcast::channel(16);

        parse_and_broadcast(r#"{"event":"pms:sync-started"}"#, &tx);

        let event = rx.try_recv().expect("event should be broadcast");
        assert_eq!(event.name, "pms:sync-started");
        assert!(event.payload.is_null());
    }

    #[test]
    fn parse_malformed_frame() {
        let (tx, mut rx) = broadcast::channel::<Arc<PushEvent>>(16);

        parse_and_broadcast("not json at all", &tx);

        // Should not panic, should just log and skip
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn control_frame_encoding() {
        let frame = serde_json::to_string(&ControlFrame {
            action: "subscribe",
            room: "room-412",
        })
        .expect("frame should encode");
        assert_eq!(frame, r#"{"action":"subscribe","room":"room-412"}"#);
    }
}
