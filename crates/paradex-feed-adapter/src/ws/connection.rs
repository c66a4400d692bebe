/*
[INPUT]:  WebSocket URL, bearer token, subscriptions, FrameHandler
[OUTPUT]: Ordered inbound frames delivered to the handler; ConnectionState updates
[POS]:    WebSocket layer - session lifecycle, dispatch loop and reconnect supervisor
[UPDATE]: When changing connect/auth/subscribe flow or reconnection policy
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::heartbeat::{HeartbeatClock, HeartbeatConfig, HeartbeatEvent, spawn_heartbeat};
use super::message::{InboundFrame, log_parse_fail_once, log_unrecognized_once, request};
use crate::error::{FeedError, Result};
use crate::stats::FeedStats;
use crate::time::now_micros;
use crate::types::{ConnectionState, StreamKind, Subscription};

pub const DEFAULT_WS_URL: &str = "wss://ws.api.prod.paradex.trade/v1";
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 3;

/// Request id reserved for the auth call; subscribe and ping ids start above it.
const AUTH_REQUEST_ID: u64 = 0;
const HEARTBEAT_EVENT_CAPACITY: usize = 8;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Write half of a session. Clones share one mutex so whole messages never interleave.
#[derive(Clone)]
pub struct FrameSender {
    sink: Arc<Mutex<WsSink>>,
}

impl FrameSender {
    fn new(sink: WsSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub async fn send(&self, message: WsMessage) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(FeedError::from)
    }

    pub async fn send_json(&self, payload: &Value) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        self.send(WsMessage::Text(text.into())).await
    }

    /// Transport-level ping.
    pub async fn send_ping(&self) -> Result<()> {
        self.send(WsMessage::Ping(Default::default())).await
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

impl fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSender").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry, and the fixed delay when backoff is off.
    pub interval: Duration,
    /// Double the delay per consecutive failed attempt.
    pub exponential_backoff: bool,
    /// Upper bound for the backoff delay (before jitter).
    pub max_interval: Duration,
    /// Random extra delay as a fraction of the base, in `[0, jitter_ratio]`.
    /// Must be finite and within `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
            exponential_backoff: false,
            max_interval: DEFAULT_MAX_RECONNECT_INTERVAL,
            jitter_ratio: 0.0,
        }
    }
}

/// Delay before reconnect attempt number `attempt` (zero-based).
///
/// `base = interval * 2^attempt` capped at `max_interval` when backoff is on,
/// otherwise `interval`. Jitter adds a random amount in `[0, jitter_ratio * base]`.
pub fn calculate_backoff(config: &ReconnectConfig, attempt: u32) -> Duration {
    let base = if config.exponential_backoff {
        config
            .interval
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(config.max_interval)
    } else {
        config.interval
    };

    if config.jitter_ratio.is_nan() || config.jitter_ratio <= 0.0 {
        return base;
    }
    let jitter_frac = rand::random::<f64>() * config.jitter_ratio.min(1.0);
    match Duration::try_from_secs_f64(base.as_secs_f64() * jitter_frac) {
        Ok(jitter) => base.saturating_add(jitter),
        Err(_) => base,
    }
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub url: String,
    /// Sent as a JSON-RPC `auth` call before subscribing when present.
    pub bearer_token: Option<String>,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    /// Auth/subscribe rejections tolerated since the last session that reached
    /// Subscribed. Transport failures in between neither count nor reset it.
    pub max_auth_failures: u32,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(FeedError::Config(format!(
                "websocket url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        if self.max_auth_failures == 0 {
            return Err(FeedError::Config(
                "max_auth_failures must be at least 1".to_string(),
            ));
        }
        let jitter = self.reconnect.jitter_ratio;
        if !jitter.is_finite() || !(0.0..=1.0).contains(&jitter) {
            return Err(FeedError::Config(format!(
                "reconnect jitter_ratio must be within [0, 1], got {jitter}"
            )));
        }
        let heartbeat = &self.heartbeat;
        let periods = [
            ("ping_interval", heartbeat.ping_interval),
            ("ping_timeout", heartbeat.ping_timeout),
            ("app_ping_interval", heartbeat.app_ping_interval),
            ("heartbeat_timeout", heartbeat.heartbeat_timeout),
            ("watchdog_period", heartbeat.watchdog_period),
            ("subscribe_timeout", self.subscribe_timeout),
            ("connect_timeout", self.connect_timeout),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, period)| period.is_zero()) {
            return Err(FeedError::Config(format!("{name} must be non-zero")));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            bearer_token: None,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("heartbeat", &self.heartbeat)
            .field("reconnect", &self.reconnect)
            .field("connect_timeout", &self.connect_timeout)
            .field("subscribe_timeout", &self.subscribe_timeout)
            .field("max_auth_failures", &self.max_auth_failures)
            .finish()
    }
}

/// What the dispatch loop should do after a data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// Unsubscribe and resubscribe `channel` to obtain a fresh snapshot.
    Resync { channel: String },
}

/// Consumer of one stream's data frames. Runs on the dispatch task.
pub trait FrameHandler: Send {
    /// Only book and trade frames are delivered here.
    fn on_frame(&mut self, frame: InboundFrame, local_time_us: i64) -> FrameAction;

    /// Called on entering Reconnecting, before any frame of the next session.
    fn on_reset(&mut self);

    fn on_state_change(&mut self, _state: ConnectionState) {}
}

/// Subscribe ids (and their channels) awaiting confirmation.
#[derive(Debug, Default)]
struct SubscriptionTracker {
    pending: HashMap<u64, String>,
}

impl SubscriptionTracker {
    fn track(&mut self, id: u64, channel: String) {
        self.pending.insert(id, channel);
    }

    fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    fn confirm_id(&mut self, id: u64) -> Option<String> {
        self.pending.remove(&id)
    }

    /// Data on a channel implies its subscription took effect.
    fn confirm_channel(&mut self, channel: &str) {
        self.pending.retain(|_, pending| pending != channel);
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

enum SessionEnd {
    Stopped,
    Failed { error: FeedError, subscribed: bool },
}

/// Supervises sessions for one logical stream.
pub struct ConnectionManager {
    kind: StreamKind,
    config: ConnectionConfig,
    subscriptions: Vec<Subscription>,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<FeedStats>,
    request_ids: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(
        kind: StreamKind,
        config: ConnectionConfig,
        subscriptions: Vec<Subscription>,
        stats: Arc<FeedStats>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            kind,
            config,
            subscriptions,
            state_tx,
            stats,
            request_ids: Arc::new(AtomicU64::new(AUTH_REQUEST_ID + 1)),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state<H: FrameHandler>(&self, handler: &mut H, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(stream = %self.kind, %state, "connection state changed");
            handler.on_state_change(state);
        }
    }

    /// Run sessions until `stop` fires (`Ok`), auth keeps being rejected, or a
    /// session fails with an error that is neither retryable nor auth (`Err`).
    pub async fn run<H: FrameHandler>(&self, handler: &mut H, stop: CancellationToken) -> Result<()> {
        let mut attempt: u32 = 0;
        let mut auth_failures: u32 = 0;

        loop {
            if stop.is_cancelled() {
                self.set_state(handler, ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(handler, ConnectionState::Connecting);
            let (error, subscribed) = match self.run_session(handler, &stop).await {
                SessionEnd::Stopped => {
                    self.set_state(handler, ConnectionState::Disconnected);
                    info!(stream = %self.kind, "feed stopped");
                    return Ok(());
                }
                SessionEnd::Failed { error, subscribed } => (error, subscribed),
            };

            if subscribed {
                attempt = 0;
                auth_failures = 0;
            }
            if error.is_auth_error() {
                auth_failures += 1;
                if auth_failures >= self.config.max_auth_failures {
                    warn!(
                        stream = %self.kind,
                        failures = auth_failures,
                        error = %error,
                        "authentication rejected; giving up"
                    );
                    self.set_state(handler, ConnectionState::Disconnected);
                    return Err(error);
                }
            } else if !error.is_retryable() {
                warn!(stream = %self.kind, error = %error, "unrecoverable session error; giving up");
                self.set_state(handler, ConnectionState::Disconnected);
                return Err(error);
            }

            self.set_state(handler, ConnectionState::Reconnecting);
            handler.on_reset();
            self.stats.record_reconnect();

            let delay = calculate_backoff(&self.config.reconnect, attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                stream = %self.kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "session ended; reconnecting"
            );

            tokio::select! {
                _ = stop.cancelled() => {
                    self.set_state(handler, ConnectionState::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session<H: FrameHandler>(&self, handler: &mut H, stop: &CancellationToken) -> SessionEnd {
        let failed = |error: FeedError| SessionEnd::Failed {
            error,
            subscribed: false,
        };

        let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(self.config.url.as_str()));
        let ws_stream = tokio::select! {
            _ = stop.cancelled() => return SessionEnd::Stopped,
            result = connect => match result {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(err)) => return failed(err.into()),
                Err(_) => {
                    return failed(FeedError::Transport(format!(
                        "connect timed out after {:?}",
                        self.config.connect_timeout
                    )));
                }
            },
        };
        debug!(stream = %self.kind, url = %self.config.url, "websocket connected");

        let (sink, read) = ws_stream.split();
        let sender = FrameSender::new(sink);
        let clock = HeartbeatClock::new();

        let tracker = match self.open_session(&sender).await {
            Ok(tracker) => tracker,
            Err(err) => {
                sender.close().await;
                return failed(err);
            }
        };

        let session_cancel = stop.child_token();
        let (event_tx, event_rx) = mpsc::channel(HEARTBEAT_EVENT_CAPACITY);
        let heartbeat = spawn_heartbeat(
            self.config.heartbeat,
            sender.clone(),
            clock.clone(),
            self.request_ids.clone(),
            event_tx,
            session_cancel.clone(),
        );

        let mut session = Session {
            manager: self,
            sender: sender.clone(),
            clock,
            tracker,
            subscribed: false,
        };
        let end = session.dispatch(handler, read, event_rx, stop).await;

        session_cancel.cancel();
        let _ = heartbeat.await;
        sender.close().await;
        end
    }

    /// Auth (if configured) then one subscribe per subscription.
    async fn open_session(&self, sender: &FrameSender) -> Result<SubscriptionTracker> {
        if let Some(token) = self.config.bearer_token.as_deref() {
            sender.send_json(&request::auth(token, AUTH_REQUEST_ID)).await?;
            debug!(stream = %self.kind, "auth sent");
        }

        let mut tracker = SubscriptionTracker::default();
        for subscription in &self.subscriptions {
            let channel = subscription.channel();
            let id = self.next_request_id();
            sender.send_json(&request::subscribe(&channel, id)).await?;
            info!(stream = %self.kind, id, %channel, "subscribe sent");
            tracker.track(id, channel);
        }
        Ok(tracker)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("kind", &self.kind)
            .field("subscriptions", &self.subscriptions.len())
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

/// One live connection: the dispatch loop and its bookkeeping.
struct Session<'a> {
    manager: &'a ConnectionManager,
    sender: FrameSender,
    clock: HeartbeatClock,
    tracker: SubscriptionTracker,
    subscribed: bool,
}

impl Session<'_> {
    async fn dispatch<H, S>(
        &mut self,
        handler: &mut H,
        mut read: S,
        mut events: mpsc::Receiver<HeartbeatEvent>,
        stop: &CancellationToken,
    ) -> SessionEnd
    where
        H: FrameHandler,
        S: futures_util::Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let kind = self.manager.kind;
        let subscribe_deadline = tokio::time::sleep(self.manager.config.subscribe_timeout);
        tokio::pin!(subscribe_deadline);

        self.mark_subscribed_if_complete(handler);

        let error = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return SessionEnd::Stopped,
                Some(event) = events.recv() => match event {
                    HeartbeatEvent::Degraded => {
                        if self.manager.current_state() == ConnectionState::Subscribed {
                            self.manager.set_state(handler, ConnectionState::Degraded);
                        }
                    }
                    HeartbeatEvent::Failed(err) => {
                        if matches!(err, FeedError::HeartbeatTimeout { .. }) {
                            self.manager.stats.record_heartbeat_timeout();
                        }
                        break err;
                    }
                },
                _ = &mut subscribe_deadline, if !self.subscribed => {
                    break FeedError::SubscribeTimeout(self.manager.config.subscribe_timeout);
                }
                incoming = read.next() => match incoming {
                    Some(Ok(message)) => {
                        self.clock.record_message();
                        if let Err(err) = self.on_message(handler, message).await {
                            break err;
                        }
                    }
                    Some(Err(err)) => break FeedError::from(err),
                    None => break FeedError::Transport("connection closed by peer".to_string()),
                },
            }
        };

        debug!(stream = %kind, error = %error, "session failed");
        SessionEnd::Failed {
            error,
            subscribed: self.subscribed,
        }
    }

    async fn on_message<H: FrameHandler>(&mut self, handler: &mut H, message: WsMessage) -> Result<()> {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    self.manager.stats.record_protocol_error();
                    debug!(bytes = bytes.len(), "non-utf8 binary frame skipped");
                    return Ok(());
                }
            },
            WsMessage::Pong(_) => {
                self.clock.record_transport_pong();
                return Ok(());
            }
            WsMessage::Ping(_) | WsMessage::Frame(_) => return Ok(()),
            WsMessage::Close(frame) => {
                let reason = frame
                    .map(|frame| frame.reason.to_string())
                    .unwrap_or_default();
                return Err(FeedError::Transport(format!("server closed connection: {reason}")));
            }
        };

        self.manager.stats.record_frame();
        let frame = match InboundFrame::parse(&text) {
            Ok(frame) => frame,
            Err(err) => {
                self.manager.stats.record_protocol_error();
                log_parse_fail_once(&err, &text);
                return Ok(());
            }
        };

        self.on_frame(handler, frame, &text).await
    }

    async fn on_frame<H: FrameHandler>(&mut self, handler: &mut H, frame: InboundFrame, raw: &str) -> Result<()> {
        let kind = self.manager.kind;
        match frame {
            InboundFrame::Ping { id } => {
                self.sender.send_json(&request::pong(&id)).await?;
                debug!(stream = %kind, %id, "server ping answered");
            }
            InboundFrame::Pong { id } => {
                self.clock.record_app_pong();
                debug!(stream = %kind, %id, "application pong received");
                if self.manager.current_state() == ConnectionState::Degraded {
                    self.manager.set_state(handler, ConnectionState::Subscribed);
                }
            }
            InboundFrame::Response { id, .. } => match id {
                Some(AUTH_REQUEST_ID) => debug!(stream = %kind, "auth accepted"),
                Some(id) => {
                    if let Some(channel) = self.tracker.confirm_id(id) {
                        debug!(stream = %kind, id, %channel, "subscription confirmed");
                        self.mark_subscribed_if_complete(handler);
                    }
                }
                None => {}
            },
            InboundFrame::Error { id, error } => {
                let rejected = match id {
                    Some(AUTH_REQUEST_ID) => Some("auth"),
                    Some(id) if self.tracker.contains(id) => Some("subscribe"),
                    _ => None,
                };
                if let Some(request) = rejected {
                    warn!(
                        stream = %kind,
                        request,
                        code = error.code,
                        message = %error.message,
                        "request rejected"
                    );
                    return Err(FeedError::Auth {
                        code: error.code,
                        message: error.message,
                    });
                }
                warn!(stream = %kind, ?id, code = error.code, message = %error.message, "server error");
            }
            InboundFrame::BookSnapshot { ref channel, .. }
            | InboundFrame::BookDelta { ref channel, .. }
            | InboundFrame::Trade { ref channel, .. } => {
                if !self.subscribed {
                    self.tracker.confirm_channel(channel);
                    self.mark_subscribed_if_complete(handler);
                }
                if let FrameAction::Resync { channel } = handler.on_frame(frame, now_micros()) {
                    self.resync(&channel).await?;
                }
            }
            InboundFrame::Unknown { .. } => log_unrecognized_once(&frame, raw),
        }
        Ok(())
    }

    fn mark_subscribed_if_complete<H: FrameHandler>(&mut self, handler: &mut H) {
        if !self.subscribed && self.tracker.is_complete() {
            self.subscribed = true;
            self.manager.set_state(handler, ConnectionState::Subscribed);
        }
    }

    async fn resync(&mut self, channel: &str) -> Result<()> {
        let unsubscribe_id = self.manager.next_request_id();
        self.sender
            .send_json(&request::unsubscribe(channel, unsubscribe_id))
            .await?;
        let subscribe_id = self.manager.next_request_id();
        self.sender
            .send_json(&request::subscribe(channel, subscribe_id))
            .await?;
        info!(stream = %self.manager.kind, %channel, "resubscribed for fresh snapshot");
        Ok(())
    }
}
