//! ConnectionManager: the single writer of [`ConnectionState`].
//!
//! One actor task owns the whole lifecycle: connect attempts, the
//! authenticated heartbeat session, reconnect scheduling with jittered
//! backoff, the failure circuit breaker, and server heartbeat directives.
//! Every other component observes state through watch channels and talks to
//! the actor through commands; nothing else ever transitions state, so
//! races between "reconnect timer fired" and "server said stop" cannot
//! happen — both are events serialized through the same loop.
//!
//! The session (socket + handshake + heartbeats) runs as a child task that
//! is aborted and replaced wholesale on every attempt. Session events carry
//! an epoch so a report from an already-aborted session is ignored instead
//! of corrupting the current attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{rngs::StdRng, SeedableRng};
use screenlink_core::{
    decode_control, BackoffConfig, CadenceConfig, CircuitBreaker, CircuitBreakerConfig,
    ConnectionState, ConnectionStatus, ControlMessage, DeviceMetrics, DisconnectReason,
    HealthConfig, HealthMetrics, HealthMonitor, HeartbeatCadence, HeartbeatDirective,
    InboundControl, PeerRole, PowerState, RuntimeMode,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{RelayStream, RelayTransport, WireMessage};

// ── Public surface ────────────────────────────────────────────────────────────

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// WebSocket URL of the relay, e.g. `wss://relay.example.com/device`.
    pub relay_url: String,
    pub device_id: Uuid,
    pub device_name: Option<String>,
    pub os_version: Option<String>,
    /// Budget for socket connect + WebSocket handshake + authentication.
    pub connect_timeout: Duration,
    /// Cadence of the periodic stall check while connected.
    pub stall_check_interval: Duration,
    pub cadence: CadenceConfig,
    pub backoff: BackoffConfig,
    pub circuit: CircuitBreakerConfig,
    pub health: HealthConfig,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9770/device".to_string(),
            device_id: Uuid::nil(),
            device_name: None,
            os_version: None,
            connect_timeout: Duration::from_secs(10),
            stall_check_interval: Duration::from_secs(5),
            cadence: CadenceConfig::default(),
            backoff: BackoffConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Commands accepted by the manager actor.
#[derive(Debug)]
pub enum ManagerCommand {
    /// Connect (or begin retrying) with this credential token.
    Connect { token: String },
    /// Tear the connection down and stop retrying.
    Disconnect { reason: DisconnectReason },
    SetRuntimeMode(RuntimeMode),
    SetPowerState(PowerState),
    Shutdown,
}

/// Something the streaming pipeline hands to the live session.
#[derive(Debug)]
pub enum Outbound {
    /// JSON control text.
    Control(String),
    /// An encoded video frame envelope.
    Video(Vec<u8>),
    /// A frame was evicted or discarded before transmission; counted into
    /// the session's health metrics, nothing goes on the wire.
    FrameDropped,
}

/// Shared slot holding the live session's outbound sender, if any.
///
/// The streaming transmitter takes the sender out of this slot for each
/// frame; an empty slot means "not connected, drop the frame".
pub type SharedOutbound = Arc<Mutex<Option<mpsc::Sender<Outbound>>>>;

/// Samples local device metrics for heartbeat reports.
pub trait DeviceProbe: Send + Sync {
    fn sample(&self) -> DeviceMetrics;
}

/// Probe for hosts with nothing to report.
pub struct NullDeviceProbe;

impl DeviceProbe for NullDeviceProbe {
    fn sample(&self) -> DeviceMetrics {
        DeviceMetrics::default()
    }
}

/// Caller-facing handle to a spawned connection manager.
pub struct ConnectionManagerHandle {
    commands: mpsc::Sender<ManagerCommand>,
    /// Full state machine view.
    pub state: watch::Receiver<ConnectionState>,
    /// Coarse status projection for the hosting application.
    pub status: watch::Receiver<ConnectionStatus>,
    /// Rolling health snapshots from the live session.
    pub health: watch::Receiver<HealthMetrics>,
    /// Non-control inbound messages (touch/keyboard/unknown), tagged with
    /// their `"type"` value.
    pub passthrough: mpsc::Receiver<(String, serde_json::Value)>,
    outbound: SharedOutbound,
    join: JoinHandle<()>,
}

impl ConnectionManagerHandle {
    pub async fn connect(&self, token: impl Into<String>) {
        let _ = self
            .commands
            .send(ManagerCommand::Connect {
                token: token.into(),
            })
            .await;
    }

    pub async fn disconnect(&self, reason: DisconnectReason) {
        let _ = self
            .commands
            .send(ManagerCommand::Disconnect { reason })
            .await;
    }

    pub async fn set_runtime_mode(&self, mode: RuntimeMode) {
        let _ = self.commands.send(ManagerCommand::SetRuntimeMode(mode)).await;
    }

    pub async fn set_power_state(&self, power: PowerState) {
        let _ = self.commands.send(ManagerCommand::SetPowerState(power)).await;
    }

    /// The shared outbound slot for the streaming transmitter.
    pub fn outbound(&self) -> SharedOutbound {
        Arc::clone(&self.outbound)
    }

    /// Requests a clean shutdown and waits for the actor to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(ManagerCommand::Shutdown).await;
        let _ = self.join.await;
    }
}

// ── Session pacing ────────────────────────────────────────────────────────────

/// Heartbeat pacing pushed to the live session. The actor recomputes it on
/// every runtime-mode or power change, so an established session re-paces
/// in place instead of waiting for the next connect.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SessionPacing {
    cadence: HeartbeatCadence,
    /// Whether the hosting application has the agent in view; reported in
    /// every heartbeat so the server sees real visibility.
    foreground: bool,
}

// ── Session events ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionEvent {
    epoch: u64,
    kind: SessionEventKind,
}

#[derive(Debug)]
enum SessionEventKind {
    /// Handshake completed; the relay confirmed our identity.
    Authenticated { device_id: Uuid },
    /// The relay rejected the credential. Not retryable.
    AuthRejected { reason: String },
    /// A heartbeat acknowledgment carried this reconnect directive.
    Directive(HeartbeatDirective),
    /// The session ended for any other reason.
    Ended { cause: String },
}

// ── Spawn ─────────────────────────────────────────────────────────────────────

/// Spawns the connection manager actor.
///
/// `is_stable` is the network observer's stability signal: a permission
/// gate for connect attempts, never a trigger by itself.
pub fn spawn_connection_manager(
    config: ConnectionManagerConfig,
    transport: Arc<dyn RelayTransport>,
    probe: Arc<dyn DeviceProbe>,
    is_stable: watch::Receiver<bool>,
) -> ConnectionManagerHandle {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (session_tx, session_rx) = mpsc::channel(32);
    let (passthrough_tx, passthrough_rx) = mpsc::channel(256);

    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (status_tx, status_rx) =
        watch::channel(ConnectionStatus::from_state(&ConnectionState::Disconnected));

    let now = now_std();
    let mut seed_monitor = HealthMonitor::new(config.health, now);
    let (health_tx, health_rx) = watch::channel(seed_monitor.snapshot(now));

    let outbound: SharedOutbound = Arc::new(Mutex::new(None));
    let breaker = CircuitBreaker::new(config.circuit);

    let actor = ManagerActor {
        config,
        transport,
        probe,
        state_tx,
        status_tx,
        health_tx,
        passthrough_tx,
        outbound: Arc::clone(&outbound),
        session_tx,
        token: None,
        attempt: 0,
        attempt_deferred: false,
        breaker,
        directive: HeartbeatDirective::permissive(),
        mode: RuntimeMode::default(),
        power: PowerState::default(),
        pacing_tx: None,
        session: None,
        epoch: 0,
        rng: StdRng::from_entropy(),
    };

    let join = tokio::spawn(run_actor(actor, command_rx, session_rx, is_stable));

    ConnectionManagerHandle {
        commands: command_tx,
        state: state_rx,
        status: status_rx,
        health: health_rx,
        passthrough: passthrough_rx,
        outbound,
        join,
    }
}

fn now_std() -> Instant {
    tokio::time::Instant::now().into_std()
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct ManagerActor {
    config: ConnectionManagerConfig,
    transport: Arc<dyn RelayTransport>,
    probe: Arc<dyn DeviceProbe>,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<ConnectionStatus>,
    health_tx: watch::Sender<HealthMetrics>,
    passthrough_tx: mpsc::Sender<(String, serde_json::Value)>,
    outbound: SharedOutbound,
    session_tx: mpsc::Sender<SessionEvent>,
    /// Credential for connect attempts; cleared when the relay rejects it.
    token: Option<String>,
    /// 1-based attempt counter since the last successful connection.
    attempt: u32,
    /// A due reconnect is parked until the network turns stable again;
    /// while parked, the attempt timer is disarmed instead of respinning.
    attempt_deferred: bool,
    breaker: CircuitBreaker,
    /// Latest server directive. Authoritative until a newer ack replaces it.
    directive: HeartbeatDirective,
    mode: RuntimeMode,
    power: PowerState,
    /// Pacing channel into the live session, if one exists.
    pacing_tx: Option<watch::Sender<SessionPacing>>,
    session: Option<JoinHandle<()>>,
    /// Incremented per attempt; stale session events are discarded.
    epoch: u64,
    rng: StdRng,
}

async fn run_actor(
    mut m: ManagerActor,
    mut command_rx: mpsc::Receiver<ManagerCommand>,
    mut session_rx: mpsc::Receiver<SessionEvent>,
    mut stable_rx: watch::Receiver<bool>,
) {
    loop {
        let deadline = m
            .next_deadline()
            .map(tokio::time::Instant::from_std);

        tokio::select! {
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if matches!(cmd, ManagerCommand::Shutdown) {
                    m.teardown_session().await;
                    info!("connection manager shut down");
                    break;
                }
                let stable = *stable_rx.borrow();
                m.handle_command(cmd, stable).await;
            }

            Some(event) = session_rx.recv() => {
                if event.epoch != m.epoch {
                    debug!(event_epoch = event.epoch, "discarding stale session event");
                    continue;
                }
                let stable = *stable_rx.borrow();
                m.handle_session_event(event.kind, stable).await;
            }

            changed = stable_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let stable = *stable_rx.borrow();
                m.handle_stability_change(stable).await;
            }

            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                let stable = *stable_rx.borrow();
                m.handle_deadline(stable).await;
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl ManagerActor {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.borrow().status_label();
        if prev != next.status_label() {
            info!(from = prev, to = next.status_label(), "connection state changed");
        }
        let _ = self.status_tx.send(ConnectionStatus::from_state(&next));
        let _ = self.state_tx.send(next);
    }

    /// The next timer this actor is waiting on, derived from state. All
    /// deadlines are monotonic instants re-validated at wake, so deferred
    /// timers (process suspension) cannot fire actions early or twice.
    fn next_deadline(&self) -> Option<Instant> {
        match &*self.state_tx.borrow() {
            ConnectionState::Reconnecting { next_attempt_at, .. } => {
                if self.attempt_deferred {
                    None
                } else {
                    Some(*next_attempt_at)
                }
            }
            ConnectionState::CircuitOpen { .. } => self.breaker.reopen_deadline(),
            ConnectionState::ServerBlocked { until } => *until,
            _ => None,
        }
    }

    async fn handle_command(&mut self, cmd: ManagerCommand, stable: bool) {
        match cmd {
            ManagerCommand::Connect { token } => {
                let now = now_std();
                let state = self.state_tx.borrow().clone();
                if !state.may_connect(now) {
                    warn!(state = state.status_label(), "connect refused in current state");
                    return;
                }
                self.token = Some(token);
                self.attempt = 1;
                if stable {
                    self.start_attempt().await;
                } else {
                    info!("connect requested; waiting for network stability");
                    self.attempt_deferred = true;
                    self.set_state(ConnectionState::Reconnecting {
                        attempt: self.attempt,
                        next_attempt_at: now,
                    });
                }
            }

            ManagerCommand::Disconnect { reason } => {
                info!(reason = reason.as_str(), "disconnect requested");
                self.teardown_session().await;
                self.attempt = 0;
                self.directive = HeartbeatDirective::permissive();
                if reason == DisconnectReason::CredentialsInvalid {
                    self.token = None;
                }
                self.set_state(ConnectionState::Disconnected);
            }

            ManagerCommand::SetRuntimeMode(mode) => {
                debug!(?mode, "runtime mode updated");
                self.mode = mode;
                self.repace_session();
            }

            ManagerCommand::SetPowerState(power) => {
                debug!(?power, "power state updated");
                self.power = power;
                self.repace_session();
            }

            // Handled in the actor loop.
            ManagerCommand::Shutdown => {}
        }
    }

    async fn handle_session_event(&mut self, kind: SessionEventKind, stable: bool) {
        match kind {
            SessionEventKind::Authenticated { device_id } => {
                info!(%device_id, "session authenticated");
                self.breaker.record_success();
                self.attempt = 0;
                self.set_state(ConnectionState::Connected { since: now_std() });
            }

            SessionEventKind::Directive(directive) => {
                if directive != self.directive {
                    info!(
                        should_reconnect = directive.should_reconnect,
                        delay_secs = directive.reconnect_delay.as_secs(),
                        "server reconnect directive updated"
                    );
                }
                self.directive = directive;
            }

            SessionEventKind::AuthRejected { reason } => {
                warn!(reason, "relay rejected credentials; not retrying");
                self.teardown_session().await;
                self.token = None;
                self.set_state(ConnectionState::Error {
                    message: format!("authentication rejected: {reason}"),
                    retryable: false,
                });
            }

            SessionEventKind::Ended { cause } => {
                warn!(cause, "session ended");
                self.teardown_session().await;
                self.handle_failure(cause, stable).await;
            }
        }
    }

    /// A connect attempt or live session failed; decide what happens next.
    /// The server directive outranks everything local, then the circuit
    /// breaker, then backoff scheduling.
    async fn handle_failure(&mut self, cause: String, stable: bool) {
        let now = now_std();

        if !self.directive.should_reconnect {
            info!("server directive suspends reconnection");
            self.set_state(ConnectionState::ServerBlocked { until: None });
            return;
        }

        // A non-zero server delay is a timed hold, not an ordinary retry:
        // it suppresses the local backoff curve until it expires.
        if self.directive.reconnect_delay > Duration::ZERO {
            let until = now + self.directive.reconnect_delay;
            info!(
                delay_secs = self.directive.reconnect_delay.as_secs(),
                "server directive delays reconnection"
            );
            self.set_state(ConnectionState::ServerBlocked { until: Some(until) });
            return;
        }

        if self.breaker.record_failure(now) {
            self.set_state(ConnectionState::CircuitOpen { since: now });
            return;
        }

        self.set_state(ConnectionState::Error {
            message: cause,
            retryable: true,
        });
        self.schedule_reconnect(now, stable).await;
    }

    async fn schedule_reconnect(&mut self, now: Instant, stable: bool) {
        // The backoff attempt number is the count of failures since the last
        // success, so the first retry always waits the initial delay.
        let delay = self
            .config
            .backoff
            .jittered_delay(self.attempt.max(1), &mut self.rng);
        self.attempt = self.attempt.saturating_add(1);
        self.attempt_deferred = false;

        let next_attempt_at = now + delay;
        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            stable,
            "reconnect scheduled"
        );
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.attempt,
            next_attempt_at,
        });
    }

    async fn handle_stability_change(&mut self, stable: bool) {
        if !stable {
            debug!("network no longer stable; pending attempts will wait");
            return;
        }
        // Stability returned: re-arm the timer and fire any attempt whose
        // time has already come.
        self.attempt_deferred = false;
        let now = now_std();
        let due = matches!(
            &*self.state_tx.borrow(),
            ConnectionState::Reconnecting { next_attempt_at, .. } if now >= *next_attempt_at
        );
        if due {
            self.start_attempt().await;
        }
    }

    /// A scheduled deadline fired. The state is re-read and the deadline
    /// re-validated: a stale or early wake re-arms instead of acting.
    async fn handle_deadline(&mut self, stable: bool) {
        let now = now_std();
        let state = self.state_tx.borrow().clone();

        match state {
            ConnectionState::Reconnecting { next_attempt_at, .. } => {
                if now < next_attempt_at {
                    return;
                }
                if !stable {
                    debug!("reconnect due but network unstable; waiting");
                    self.attempt_deferred = true;
                    return;
                }
                self.start_attempt().await;
            }

            ConnectionState::CircuitOpen { .. } => {
                if !self.breaker.allow_half_open_probe(now) {
                    return;
                }
                info!("circuit cooldown elapsed; probing");
                if self.token.is_some() && stable {
                    self.attempt = self.attempt.saturating_add(1);
                    self.start_attempt().await;
                } else if self.token.is_some() {
                    self.attempt = self.attempt.saturating_add(1);
                    self.attempt_deferred = true;
                    self.set_state(ConnectionState::Reconnecting {
                        attempt: self.attempt,
                        next_attempt_at: now,
                    });
                } else {
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            ConnectionState::ServerBlocked { until: Some(until) } => {
                if now < until {
                    return;
                }
                info!("server block expired");
                // The hold is consumed: exactly one attempt follows, and if
                // it fails the ordinary backoff curve takes over.
                self.directive = HeartbeatDirective::permissive();
                if self.token.is_some() {
                    self.attempt = self.attempt.saturating_add(1);
                    if stable {
                        self.start_attempt().await;
                    } else {
                        self.attempt_deferred = true;
                        self.set_state(ConnectionState::Reconnecting {
                            attempt: self.attempt,
                            next_attempt_at: now,
                        });
                    }
                } else {
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            _ => {}
        }
    }

    /// Cancel-then-replace: the previous session task is aborted before the
    /// new one spawns, so at most one session ever owns the wire.
    async fn start_attempt(&mut self) {
        let Some(token) = self.token.clone() else {
            warn!("no credential token; cannot connect");
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        self.teardown_session().await;
        self.epoch += 1;
        self.attempt_deferred = false;

        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(64);
        *self.outbound.lock().await = Some(outbound_tx);
        let (pacing_tx, pacing_rx) = watch::channel(self.current_pacing());
        self.pacing_tx = Some(pacing_tx);

        let ctx = SessionContext {
            epoch: self.epoch,
            url: self.config.relay_url.clone(),
            device_id: self.config.device_id,
            device_name: self.config.device_name.clone(),
            os_version: self.config.os_version.clone(),
            token,
            connect_timeout: self.config.connect_timeout,
            stall_check_interval: self.config.stall_check_interval,
            health: self.config.health,
        };

        self.set_state(ConnectionState::Connecting);
        self.session = Some(tokio::spawn(run_session(
            ctx,
            Arc::clone(&self.transport),
            Arc::clone(&self.probe),
            pacing_rx,
            outbound_rx,
            self.session_tx.clone(),
            self.health_tx.clone(),
            self.passthrough_tx.clone(),
        )));
    }

    async fn teardown_session(&mut self) {
        if let Some(handle) = self.session.take() {
            handle.abort();
        }
        self.pacing_tx = None;
        *self.outbound.lock().await = None;
    }

    fn current_pacing(&self) -> SessionPacing {
        SessionPacing {
            cadence: self.config.cadence.cadence(self.mode, self.power),
            foreground: self.mode == RuntimeMode::Foreground,
        }
    }

    /// Pushes the recomputed pacing into the live session, if any.
    fn repace_session(&self) {
        if let Some(tx) = &self.pacing_tx {
            let next = self.current_pacing();
            tx.send_if_modified(|pacing| {
                if *pacing == next {
                    false
                } else {
                    *pacing = next;
                    true
                }
            });
        }
    }
}

// ── Session task ──────────────────────────────────────────────────────────────

struct SessionContext {
    epoch: u64,
    url: String,
    device_id: Uuid,
    device_name: Option<String>,
    os_version: Option<String>,
    token: String,
    connect_timeout: Duration,
    stall_check_interval: Duration,
    health: HealthConfig,
}

/// Stall horizon for the current cadence. Pongs only arrive on heartbeat
/// acknowledgments, so the horizon must cover at least two beats or every
/// quiet stretch between them would read as a stall.
fn effective_stall_timeout(health: &HealthConfig, cadence: HeartbeatCadence) -> Duration {
    health.stall_timeout.max(cadence.interval * 2)
}

/// What the session select loop observed in one turn.
enum Turn {
    HeartbeatDue,
    AckTimedOut,
    StallCheckDue,
    PacingChanged(bool),
    Outbound(Option<Outbound>),
    Inbound(Option<Result<WireMessage, super::WireError>>),
}

async fn run_session(
    ctx: SessionContext,
    transport: Arc<dyn RelayTransport>,
    probe: Arc<dyn DeviceProbe>,
    mut pacing_rx: watch::Receiver<SessionPacing>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    events: mpsc::Sender<SessionEvent>,
    health_tx: watch::Sender<HealthMetrics>,
    passthrough_tx: mpsc::Sender<(String, serde_json::Value)>,
) {
    let send_event = |kind: SessionEventKind| {
        let events = events.clone();
        let epoch = ctx.epoch;
        async move {
            let _ = events.send(SessionEvent { epoch, kind }).await;
        }
    };

    let mut stream = match transport.connect(&ctx.url, ctx.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            send_event(SessionEventKind::Ended {
                cause: e.to_string(),
            })
            .await;
            return;
        }
    };

    let mut pacing = *pacing_rx.borrow_and_update();
    let mut pacing_live = true;

    let mut monitor = HealthMonitor::new(ctx.health, now_std());
    monitor.set_stall_timeout(effective_stall_timeout(&ctx.health, pacing.cadence));

    // ── Authentication handshake ──────────────────────────────────────────
    let auth = ControlMessage::Authenticate {
        role: PeerRole::Device,
        device_id: ctx.device_id,
        token: ctx.token.clone(),
        device_name: ctx.device_name.clone(),
        os_version: ctx.os_version.clone(),
    };
    let auth_json = match auth.to_json() {
        Ok(json) => json,
        Err(e) => {
            send_event(SessionEventKind::Ended {
                cause: e.to_string(),
            })
            .await;
            return;
        }
    };
    if let Err(e) = stream.send_text(auth_json).await {
        send_event(SessionEventKind::Ended {
            cause: e.to_string(),
        })
        .await;
        return;
    }

    let auth_deadline = tokio::time::Instant::now() + ctx.connect_timeout;
    let confirmed_id = loop {
        let msg = tokio::select! {
            msg = stream.next_message() => msg,
            _ = tokio::time::sleep_until(auth_deadline) => {
                stream.close().await;
                send_event(SessionEventKind::Ended {
                    cause: "authentication timed out".to_string(),
                })
                .await;
                return;
            }
        };
        match msg {
            Some(Ok(WireMessage::Text(text))) => match decode_control(&text) {
                Ok(InboundControl::Control(ControlMessage::Authenticated {
                    device_id, ..
                })) => break device_id,
                Ok(InboundControl::Control(ControlMessage::AuthFailed { reason })) => {
                    stream.close().await;
                    send_event(SessionEventKind::AuthRejected { reason }).await;
                    return;
                }
                Ok(other) => {
                    debug!(?other, "non-auth message during handshake; ignoring");
                }
                Err(e) => {
                    warn!(error = %e, "undecodable message during handshake");
                }
            },
            Some(Ok(WireMessage::Binary(_))) => {
                debug!("binary frame during handshake; ignoring");
            }
            Some(Err(e)) => {
                send_event(SessionEventKind::Ended {
                    cause: e.to_string(),
                })
                .await;
                return;
            }
            None => {
                send_event(SessionEventKind::Ended {
                    cause: "closed during handshake".to_string(),
                })
                .await;
                return;
            }
        }
    };

    send_event(SessionEventKind::Authenticated {
        device_id: confirmed_id,
    })
    .await;

    // ── Heartbeat / wire loop ─────────────────────────────────────────────
    let mut heartbeat = tokio::time::interval(pacing.cadence.interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut stall_check = tokio::time::interval(ctx.stall_check_interval);
    stall_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick of an interval fires immediately; that sends the first
    // heartbeat right after authentication, which the relay expects.
    let mut ack_deadline: Option<tokio::time::Instant> = None;

    let cause: String = loop {
        let turn = tokio::select! {
            _ = heartbeat.tick() => Turn::HeartbeatDue,
            _ = sleep_until_opt(ack_deadline), if ack_deadline.is_some() => Turn::AckTimedOut,
            _ = stall_check.tick() => Turn::StallCheckDue,
            changed = pacing_rx.changed(), if pacing_live => Turn::PacingChanged(changed.is_ok()),
            out = outbound_rx.recv() => Turn::Outbound(out),
            msg = stream.next_message() => Turn::Inbound(msg),
        };

        match turn {
            Turn::HeartbeatDue => {
                let hb = ControlMessage::Heartbeat {
                    device_token: ctx.token.clone(),
                    is_active: pacing.foreground,
                    local_metrics: probe.sample(),
                };
                match hb.to_json() {
                    Ok(json) => {
                        if let Err(e) = stream.send_text(json).await {
                            break e.to_string();
                        }
                        monitor.record_ping(now_std());
                        ack_deadline =
                            Some(tokio::time::Instant::now() + pacing.cadence.timeout);
                    }
                    Err(e) => warn!(error = %e, "failed to encode heartbeat"),
                }
            }

            Turn::PacingChanged(true) => {
                pacing = *pacing_rx.borrow_and_update();
                heartbeat = tokio::time::interval_at(
                    tokio::time::Instant::now() + pacing.cadence.interval,
                    pacing.cadence.interval,
                );
                heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                monitor.set_stall_timeout(effective_stall_timeout(&ctx.health, pacing.cadence));
                info!(
                    interval_ms = pacing.cadence.interval.as_millis() as u64,
                    timeout_ms = pacing.cadence.timeout.as_millis() as u64,
                    foreground = pacing.foreground,
                    "heartbeat cadence re-paced"
                );
            }

            Turn::PacingChanged(false) => {
                // The actor dropped its sender; it is tearing us down.
                pacing_live = false;
            }

            Turn::AckTimedOut => {
                // Re-validate at wake; a deferred timer must not count a
                // miss that already resolved.
                match ack_deadline {
                    Some(d) if tokio::time::Instant::now() >= d => {
                        break "heartbeat acknowledgment timed out".to_string();
                    }
                    _ => {}
                }
            }

            Turn::StallCheckDue => {
                let now = now_std();
                let stalled = monitor.check_stall(now);
                let _ = health_tx.send(monitor.snapshot(now));
                if stalled {
                    break "connection stalled".to_string();
                }
            }

            Turn::Outbound(Some(Outbound::Control(text))) => {
                if let Err(e) = stream.send_text(text).await {
                    break e.to_string();
                }
            }

            Turn::Outbound(Some(Outbound::Video(bytes))) => {
                let wire_len = bytes.len();
                if let Err(e) = stream.send_binary(bytes).await {
                    break e.to_string();
                }
                monitor.record_frame_sent(wire_len, now_std());
            }

            Turn::Outbound(Some(Outbound::FrameDropped)) => {
                monitor.record_frame_drop(now_std());
            }

            Turn::Outbound(None) => {
                break "outbound channel closed".to_string();
            }

            Turn::Inbound(None) => {
                break "closed by relay".to_string();
            }

            Turn::Inbound(Some(Err(e))) => {
                break e.to_string();
            }

            Turn::Inbound(Some(Ok(WireMessage::Binary(_)))) => {
                debug!("unexpected inbound binary frame; ignoring");
            }

            Turn::Inbound(Some(Ok(WireMessage::Text(text)))) => {
                match decode_control(&text) {
                    Ok(InboundControl::Control(msg)) => match &msg {
                        ControlMessage::HeartbeatAck { server_time_ms, .. } => {
                            let now = now_std();
                            if let Some(latency) = monitor.record_pong(now) {
                                debug!(
                                    latency_ms = latency.as_millis() as u64,
                                    server_time_ms = ?server_time_ms,
                                    "heartbeat acknowledged"
                                );
                            }
                            ack_deadline = None;
                            let _ = health_tx.send(monitor.snapshot(now));
                            let directive = HeartbeatDirective::from_ack(&msg)
                                .unwrap_or_else(HeartbeatDirective::permissive);
                            send_event(SessionEventKind::Directive(directive)).await;
                        }
                        ControlMessage::AuthFailed { reason } => {
                            // Mid-session credential revocation.
                            stream.close().await;
                            send_event(SessionEventKind::AuthRejected {
                                reason: reason.clone(),
                            })
                            .await;
                            return;
                        }
                        other => {
                            debug!(?other, "unexpected control message; ignoring");
                        }
                    },
                    Ok(InboundControl::Passthrough { kind, raw }) => {
                        if passthrough_tx.try_send((kind.clone(), raw)).is_err() {
                            warn!(kind, "passthrough queue full; dropping message");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable inbound message; ignoring");
                    }
                }
            }
        }
    };

    stream.close().await;
    send_event(SessionEventKind::Ended { cause }).await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::mock::MockRelayTransport;

    fn test_config() -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            device_id: Uuid::new_v4(),
            device_name: Some("test-kiosk".to_string()),
            ..Default::default()
        }
    }

    fn spawn_with(
        transport: &MockRelayTransport,
        stable: bool,
    ) -> (ConnectionManagerHandle, watch::Sender<bool>) {
        let (stable_tx, stable_rx) = watch::channel(stable);
        let handle = spawn_connection_manager(
            test_config(),
            Arc::new(transport.clone()),
            Arc::new(NullDeviceProbe),
            stable_rx,
        );
        (handle, stable_tx)
    }

    async fn authenticate(relay: &mut super::super::mock::MockRelayHandle) {
        let auth = relay.next_text().await.expect("agent must authenticate");
        assert!(auth.contains("\"type\":\"authenticate\""));
        let value: serde_json::Value = serde_json::from_str(&auth).unwrap();
        let device_id = value["device_id"].as_str().unwrap();
        relay
            .send_text(format!(
                r#"{{"type":"authenticated","device_id":"{device_id}"}}"#
            ))
            .await;
    }

    async fn wait_for_label(
        state: &mut watch::Receiver<ConnectionState>,
        label: &str,
    ) {
        loop {
            if state.borrow().status_label() == label {
                return;
            }
            state.changed().await.expect("actor alive");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_authenticates_and_reaches_connected() {
        let transport = MockRelayTransport::new();
        let mut relay = transport.push_session().await;
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;
        authenticate(&mut relay).await;

        let mut state = handle.state.clone();
        wait_for_label(&mut state, "connected").await;
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_stability() {
        let transport = MockRelayTransport::new();
        let _relay = transport.push_session().await;
        let (handle, stable_tx) = spawn_with(&transport, false);

        handle.connect("tok-1").await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            handle.state.borrow().status_label(),
            "reconnecting",
            "no attempt without stability"
        );
        assert_eq!(transport.remaining().await, 1);

        stable_tx.send(true).unwrap();
        let mut state = handle.state.clone();
        wait_for_label(&mut state, "connecting").await;
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_schedules_backoff_retry() {
        let transport = MockRelayTransport::new();
        transport.push_refusal().await;
        let mut relay_after = transport.push_session().await;
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;

        let mut state = handle.state.clone();
        wait_for_label(&mut state, "reconnecting").await;

        // First retry is 1s + jitter < 1.25s; after 2s it must have fired.
        tokio::time::sleep(Duration::from_secs(2)).await;
        authenticate(&mut relay_after).await;
        wait_for_label(&mut state, "connected").await;
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_is_terminal() {
        let transport = MockRelayTransport::new();
        let mut relay = transport.push_session().await;
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("bad-token").await;
        let _auth = relay.next_text().await.unwrap();
        relay
            .send_text(r#"{"type":"auth_failed","reason":"token expired"}"#)
            .await;

        let mut state = handle.state.clone();
        wait_for_label(&mut state, "error").await;

        // No further attempt is ever made.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.state.borrow().status_label(), "error");
        assert_eq!(transport.remaining().await, 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_directive_blocks_reconnection() {
        let transport = MockRelayTransport::new();
        let mut relay = transport.push_session().await;
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;
        authenticate(&mut relay).await;
        let mut state = handle.state.clone();
        wait_for_label(&mut state, "connected").await;

        // First heartbeat arrives promptly; answer it with a stop order.
        let hb = relay.next_text().await.unwrap();
        assert!(hb.contains("\"type\":\"heartbeat\""));
        relay
            .send_text(r#"{"type":"heartbeat_ack","should_reconnect":false}"#)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Relay closes; the directive must win over local backoff.
        drop(relay);
        wait_for_label(&mut state, "blocked").await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(handle.state.borrow().status_label(), "blocked");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_directive_enters_timed_server_block() {
        let transport = MockRelayTransport::new();
        let mut relay = transport.push_session().await;
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;
        authenticate(&mut relay).await;
        let mut state = handle.state.clone();
        wait_for_label(&mut state, "connected").await;

        // Answer the first heartbeat with a 60s hold, then drop the relay.
        let hb = relay.next_text().await.unwrap();
        assert!(hb.contains("\"type\":\"heartbeat\""));
        relay
            .send_text(
                r#"{"type":"heartbeat_ack","should_reconnect":true,"reconnect_delay_seconds":60}"#,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(relay);
        wait_for_label(&mut state, "blocked").await;

        // No attempt before the hold expires.
        let mut relay_after = transport.push_session().await;
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(handle.state.borrow().status_label(), "blocked");
        assert_eq!(transport.remaining().await, 1);

        // Exactly one attempt once it does.
        tokio::time::sleep(Duration::from_secs(2)).await;
        authenticate(&mut relay_after).await;
        wait_for_label(&mut state, "connected").await;
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backgrounding_repaces_the_live_heartbeat() {
        let transport = MockRelayTransport::new();
        let mut relay = transport.push_session().await;
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;
        authenticate(&mut relay).await;
        let mut state = handle.state.clone();
        wait_for_label(&mut state, "connected").await;

        // The immediate first heartbeat still reports foreground.
        let first = relay.next_text().await.unwrap();
        assert!(first.contains("\"is_active\":true"));
        relay
            .send_text(
                r#"{"type":"heartbeat_ack","should_reconnect":true,"reconnect_delay_seconds":0}"#,
            )
            .await;

        handle.set_runtime_mode(RuntimeMode::Background).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Background doubles the 30s interval: the wire stays quiet until
        // the widened beat.
        let quiet = tokio::time::timeout(Duration::from_secs(59), relay.next_text()).await;
        assert!(quiet.is_err(), "heartbeat fired before the widened interval");

        let second = tokio::time::timeout(Duration::from_secs(3), relay.next_text())
            .await
            .expect("widened heartbeat due")
            .unwrap();
        assert!(second.contains("\"is_active\":false"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_consecutive_failures() {
        let transport = MockRelayTransport::new();
        for _ in 0..5 {
            transport.push_refusal().await;
        }
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;

        let mut state = handle.state.clone();
        wait_for_label(&mut state, "circuit-open").await;
        assert_eq!(transport.remaining().await, 0, "exactly five attempts");

        // Cooldown is 300s; a probe fires after it.
        let mut relay = transport.push_session().await;
        tokio::time::sleep(Duration::from_secs(301)).await;
        authenticate(&mut relay).await;
        wait_for_label(&mut state, "connected").await;
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_retrying() {
        let transport = MockRelayTransport::new();
        transport.push_refusal().await;
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;
        let mut state = handle.state.clone();
        wait_for_label(&mut state, "reconnecting").await;

        handle.disconnect(DisconnectReason::UserInitiated).await;
        wait_for_label(&mut state, "disconnected").await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.state.borrow().status_label(), "disconnected");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_passthrough_messages_are_forwarded() {
        let transport = MockRelayTransport::new();
        let mut relay = transport.push_session().await;
        let (mut handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;
        authenticate(&mut relay).await;
        let mut state = handle.state.clone();
        wait_for_label(&mut state, "connected").await;

        relay
            .send_text(r#"{"type":"touch","x":120,"y":48,"action":"down"}"#)
            .await;

        let (kind, raw) = handle.passthrough.recv().await.unwrap();
        assert_eq!(kind, "touch");
        assert_eq!(raw["x"], 120);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ack_latency_reaches_health_watch() {
        let transport = MockRelayTransport::new();
        let mut relay = transport.push_session().await;
        let (handle, _stable) = spawn_with(&transport, true);

        handle.connect("tok-1").await;
        authenticate(&mut relay).await;

        let hb = relay.next_text().await.unwrap();
        assert!(hb.contains("\"type\":\"heartbeat\""));
        relay
            .send_text(r#"{"type":"heartbeat_ack","should_reconnect":true,"reconnect_delay_seconds":0,"server_time_ms":1724000000000}"#)
            .await;

        let mut health = handle.health.clone();
        // Wait until a snapshot with a pong lands.
        loop {
            if health.borrow().consecutive_healthy_checks > 0 {
                break;
            }
            health.changed().await.unwrap();
        }
        handle.shutdown().await;
    }
}
