/*
[INPUT]:  Liveness timestamps from the receive path; heartbeat timing config
[OUTPUT]: Transport/application pings and liveness verdicts for the session
[POS]:    WebSocket layer - dual heartbeat and staleness watchdog
[UPDATE]: When ping cadence, timeout rules or degradation semantics change
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::FrameSender;
use super::message::request;
use crate::error::FeedError;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_APP_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Transport-level ping cadence.
    pub ping_interval: Duration,
    /// Max wait for a pong (transport or application) before acting.
    pub ping_timeout: Duration,
    /// JSON-RPC `ping` cadence.
    pub app_ping_interval: Duration,
    /// Silence on the socket after which the session is torn down.
    pub heartbeat_timeout: Duration,
    pub watchdog_period: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            app_ping_interval: DEFAULT_APP_PING_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            watchdog_period: DEFAULT_WATCHDOG_PERIOD,
        }
    }
}

/// Point-in-time copy of the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    pub last_message: Instant,
    pub last_transport_pong: Option<Instant>,
    pub last_app_pong: Option<Instant>,
}

/// Liveness timestamps for one session.
///
/// Written only by the dispatch loop, read by the heartbeat task.
#[derive(Debug, Clone)]
pub struct HeartbeatClock {
    inner: Arc<Mutex<ClockReading>>,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockReading {
                last_message: now,
                last_transport_pong: None,
                last_app_pong: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockReading> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_message(&self) {
        self.lock().last_message = Instant::now();
    }

    pub fn record_transport_pong(&self) {
        self.lock().last_transport_pong = Some(Instant::now());
    }

    pub fn record_app_pong(&self) {
        self.lock().last_app_pong = Some(Instant::now());
    }

    pub fn read(&self) -> ClockReading {
        *self.lock()
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one watchdog evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Healthy,
    /// An application ping has gone unanswered past the pong timeout.
    Degraded,
    /// A transport ping has gone unanswered past the pong timeout.
    PongTimeout { elapsed: Duration },
    /// Nothing at all received within the heartbeat timeout.
    Stale { elapsed: Duration },
}

impl HeartbeatAction {
    /// Session-ending verdicts as errors.
    pub fn into_error(self) -> Option<FeedError> {
        match self {
            HeartbeatAction::PongTimeout { elapsed } => Some(FeedError::HeartbeatTimeout {
                reason: "transport pong not received".to_string(),
                elapsed,
            }),
            HeartbeatAction::Stale { elapsed } => Some(FeedError::HeartbeatTimeout {
                reason: "no message received".to_string(),
                elapsed,
            }),
            HeartbeatAction::Healthy | HeartbeatAction::Degraded => None,
        }
    }
}

/// Outstanding-ping bookkeeping plus the watchdog rules.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    transport_ping_sent: Option<Instant>,
    app_ping_sent: Option<Instant>,
    degraded_reported: bool,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            transport_ping_sent: None,
            app_ping_sent: None,
            degraded_reported: false,
        }
    }

    /// Keeps the oldest unanswered send time.
    pub fn on_transport_ping_sent(&mut self, at: Instant) {
        self.transport_ping_sent.get_or_insert(at);
    }

    pub fn on_app_ping_sent(&mut self, at: Instant) {
        self.app_ping_sent.get_or_insert(at);
    }

    /// Evaluate liveness. `Degraded` is reported once per unanswered episode.
    pub fn check(&mut self, now: Instant, clock: ClockReading) -> HeartbeatAction {
        self.settle(clock);

        let silence = now.saturating_duration_since(clock.last_message);
        if silence >= self.config.heartbeat_timeout {
            return HeartbeatAction::Stale { elapsed: silence };
        }

        if let Some(sent) = self.transport_ping_sent {
            let waited = now.saturating_duration_since(sent);
            if waited >= self.config.ping_timeout {
                return HeartbeatAction::PongTimeout { elapsed: waited };
            }
        }

        if let Some(sent) = self.app_ping_sent
            && !self.degraded_reported
            && now.saturating_duration_since(sent) >= self.config.ping_timeout
        {
            self.degraded_reported = true;
            return HeartbeatAction::Degraded;
        }

        HeartbeatAction::Healthy
    }

    fn settle(&mut self, clock: ClockReading) {
        if let (Some(sent), Some(pong)) = (self.transport_ping_sent, clock.last_transport_pong)
            && pong >= sent
        {
            self.transport_ping_sent = None;
        }
        if let (Some(sent), Some(pong)) = (self.app_ping_sent, clock.last_app_pong)
            && pong >= sent
        {
            self.app_ping_sent = None;
            self.degraded_reported = false;
        }
    }
}

/// Reports from the heartbeat task to the dispatch loop.
#[derive(Debug)]
pub enum HeartbeatEvent {
    Degraded,
    Failed(FeedError),
}

/// Spawn the heartbeat task for one session. It stops on `cancel` or after
/// reporting the first failure.
pub(crate) fn spawn_heartbeat(
    config: HeartbeatConfig,
    sender: FrameSender,
    clock: HeartbeatClock,
    request_ids: Arc<AtomicU64>,
    events: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_heartbeat(config, sender, clock, request_ids, events, cancel).await;
    })
}

async fn run_heartbeat(
    config: HeartbeatConfig,
    sender: FrameSender,
    clock: HeartbeatClock,
    request_ids: Arc<AtomicU64>,
    events: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
) {
    let start = Instant::now();
    let mut transport_tick = interval_at(start + config.ping_interval, config.ping_interval);
    let mut app_tick = interval_at(start + config.app_ping_interval, config.app_ping_interval);
    let mut watchdog = interval(config.watchdog_period);
    for ticker in [&mut transport_tick, &mut app_tick, &mut watchdog] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    let mut monitor = HeartbeatMonitor::new(config);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = watchdog.tick() => {
                match monitor.check(Instant::now(), clock.read()) {
                    HeartbeatAction::Healthy => {}
                    HeartbeatAction::Degraded => {
                        warn!(timeout_ms = config.ping_timeout.as_millis() as u64, "application pong overdue");
                        if events.send(HeartbeatEvent::Degraded).await.is_err() {
                            return;
                        }
                    }
                    action => {
                        if let Some(err) = action.into_error() {
                            warn!(error = %err, "heartbeat failed");
                            let _ = events.send(HeartbeatEvent::Failed(err)).await;
                        }
                        return;
                    }
                }
            }
            _ = transport_tick.tick() => {
                if let Err(err) = sender.send_ping().await {
                    warn!(error = %err, "transport ping send failed");
                    let _ = events.send(HeartbeatEvent::Failed(err)).await;
                    return;
                }
                monitor.on_transport_ping_sent(Instant::now());
            }
            _ = app_tick.tick() => {
                let id = request_ids.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = sender.send_json(&request::ping(id)).await {
                    warn!(id, error = %err, "application ping send failed");
                    let _ = events.send(HeartbeatEvent::Failed(err)).await;
                    return;
                }
                debug!(id, "application ping sent");
                monitor.on_app_ping_sent(Instant::now());
            }
        }
    }
}
