//! One gateway connection, kept alive across reconnects.
//!
//! [`StreamingSession::connect`] spawns a supervisor task that owns the
//! connection: it reads frames, answers control opcodes and forwards
//! dispatches to the [`EventRegistry`]. A second task per connection sends
//! heartbeats. Both touch [`SessionState`] only under its lock, for the
//! duration of a field update.
//!
//! Transport failures always reconnect and resume. Only an explicit
//! server signal (invalid session, session-ending close code) discards the
//! session, and only fatal close codes or an unresumable invalid session stop
//! the supervisor.

use crate::close_code::{self, CloseAction, NORMAL_CLOSURE, RESUME_CLOSURE};
use crate::{
    Beat, ClientPayload, Command, CommandLimiter, Connection, ConnectionProperties, Connector,
    Dispatch, EventRegistry, FrameCodec, GatewayEvent, GatewaySink, HandlerId, HeartbeatMonitor,
    Identify, OpCode, PayloadError, Ready, Resume, ServerPayload, WireMessage,
};
use conduit_core::{Credentials, GatewayConfig, record_gateway_lifecycle};
use conduit_error::{GatewayError, GatewayErrorKind, GatewayResult};
use conduit_rate_limit::{Backoff, IdentifyLimiter};
use parking_lot::Mutex;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, instrument, trace, warn};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display)]
pub enum SessionPhase {
    /// No connection and no supervisor
    #[default]
    Disconnected,
    /// Opening the transport or waiting for Hello
    Connecting,
    /// Identify sent, waiting for READY
    Identifying,
    /// Resume sent, waiting for RESUMED
    Resuming,
    /// Receiving events
    Connected,
    /// The server discarded the session; `connect` must be called again
    Invalidated,
}

/// Shard index and total shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{index}/{count}")]
pub struct ShardInfo {
    /// This shard's index
    pub index: u32,
    /// Total shards
    pub count: u32,
}

impl ShardInfo {
    /// Shard `index` of `count`.
    pub fn new(index: u32, count: u32) -> Self {
        Self { index, count }
    }
}

impl Default for ShardInfo {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

/// Lifecycle notifications, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// READY or RESUMED arrived
    Connected {
        /// Whether the previous session was resumed
        resumed: bool,
    },
    /// The connection was lost and a new one is being opened
    Reconnecting {
        /// Reconnects since the last successful READY/RESUMED
        attempt: u32,
        /// Whether the new connection will resume
        resume: bool,
    },
    /// The server sent Invalid Session
    Invalidated {
        /// Whether the session may be resumed
        resumable: bool,
    },
    /// The supervisor stopped
    Disconnected {
        /// Whether the caller asked for it
        requested: bool,
    },
    /// The server closed with a code that forbids reconnecting
    Fatal {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

impl LifecycleEvent {
    /// Short name, used for metrics.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Connected { resumed: false } => "ready",
            LifecycleEvent::Connected { resumed: true } => "resumed",
            LifecycleEvent::Reconnecting { .. } => "reconnecting",
            LifecycleEvent::Invalidated { .. } => "invalidated",
            LifecycleEvent::Disconnected { .. } => "disconnected",
            LifecycleEvent::Fatal { .. } => "fatal",
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_url: Option<String>,
    heartbeat: Option<HeartbeatMonitor>,
}

impl SessionState {
    fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    fn clear_session(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }

    /// Sequence numbers only move forward.
    fn observe_sequence(&mut self, sequence: Option<u64>) {
        if let Some(seq) = sequence {
            self.sequence = Some(self.sequence.map_or(seq, |current| current.max(seq)));
        }
    }
}

type SharedSink = Arc<AsyncMutex<Box<dyn GatewaySink>>>;

#[derive(Clone)]
struct CommandChannel {
    sink: SharedSink,
    limiter: Arc<CommandLimiter>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct SessionInner {
    shard: ShardInfo,
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    identify: Arc<IdentifyLimiter>,
    events: Arc<EventRegistry>,
    state: Mutex<SessionState>,
    commands: Mutex<Option<CommandChannel>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    running: AsyncMutex<Option<Running>>,
}

impl SessionInner {
    fn set_phase(&self, phase: SessionPhase) {
        let mut state = self.state.lock();
        if state.phase != phase {
            debug!(from = %state.phase, to = %phase, "Session phase changed");
            state.phase = phase;
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        record_gateway_lifecycle(self.shard.index, event.name());
        let _ = self.lifecycle.send(event);
    }
}

/// A resumable gateway session for one shard.
///
/// Cheap to clone; clones control the same session.
#[derive(Clone)]
pub struct StreamingSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("shard", &self.inner.shard)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl StreamingSession {
    /// Unsharded session with its own identify limiter and event registry.
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        let identify = Arc::new(IdentifyLimiter::from_config(&config));
        Self::for_shard(
            config,
            ShardInfo::default(),
            connector,
            identify,
            Arc::new(EventRegistry::new()),
        )
    }

    /// Session for one shard, sharing the account's identify limiter and
    /// the client's event registry.
    pub fn for_shard(
        config: GatewayConfig,
        shard: ShardInfo,
        connector: Arc<dyn Connector>,
        identify: Arc<IdentifyLimiter>,
        events: Arc<EventRegistry>,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(SessionInner {
                shard,
                config,
                connector,
                identify,
                events,
                state: Mutex::new(SessionState::default()),
                commands: Mutex::new(None),
                lifecycle,
                running: AsyncMutex::new(None),
            }),
        }
    }

    /// Shard this session serves.
    pub fn shard(&self) -> ShardInfo {
        self.inner.shard
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    /// Session id from the last READY, kept across resumes.
    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    /// Highest sequence number received in this session.
    pub fn sequence(&self) -> Option<u64> {
        self.inner.state.lock().sequence
    }

    /// Round trip of the last acknowledged heartbeat on the live connection.
    pub fn latency(&self) -> Option<Duration> {
        self.inner
            .state
            .lock()
            .heartbeat
            .as_ref()
            .and_then(HeartbeatMonitor::latency)
    }

    /// Registry dispatched events are published to.
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.inner.events
    }

    /// Register a handler for events named `name`.
    pub fn on_event<F, Fut>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(GatewayEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.events.on(name, handler)
    }

    /// Subscribe to lifecycle notifications.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.lifecycle.subscribe()
    }

    /// Connect and wait for READY (or RESUMED), giving up after the
    /// configured connect timeout.
    ///
    /// # Errors
    ///
    /// See [`connect_with_deadline`](Self::connect_with_deadline).
    pub async fn connect(&self, credentials: &Credentials) -> GatewayResult<()> {
        let deadline = Instant::now() + self.inner.config.connect_timeout();
        self.connect_with_deadline(credentials, deadline).await
    }

    /// Connect and wait for READY (or RESUMED) until `deadline`.
    ///
    /// Sends Resume if a previous session is still resumable, otherwise
    /// Identify. Once connected the session reconnects on its own until
    /// [`disconnect`](Self::disconnect) is called.
    ///
    /// # Errors
    ///
    /// - `AlreadyConnected` if the session is running
    /// - `DeadlineExceeded` if READY does not arrive in time; the session is
    ///   stopped
    /// - `Fatal` if the server closed with a non-recoverable code
    /// - `SessionInvalidated` if the server rejected the session
    #[instrument(skip(self, credentials), fields(shard = %self.inner.shard))]
    pub async fn connect_with_deadline(
        &self,
        credentials: &Credentials,
        deadline: Instant,
    ) -> GatewayResult<()> {
        let ready = {
            let mut running = self.inner.running.lock().await;
            if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
                return Err(GatewayError::new(GatewayErrorKind::AlreadyConnected));
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (ready_tx, ready_rx) = oneshot::channel();
            let config = &self.inner.config;
            let supervisor = Supervisor {
                inner: Arc::clone(&self.inner),
                credentials: credentials.clone(),
                shutdown: shutdown_rx,
                ready: Some(ready_tx),
                backoff: Backoff::new(config.reconnect_base_delay(), config.reconnect_max_delay())
                    .with_jitter(true),
                attempt: 0,
            };
            let span = tracing::info_span!("gateway_session", shard = %self.inner.shard);
            let task = tokio::spawn(supervisor.run().instrument(span));
            *running = Some(Running {
                shutdown: shutdown_tx,
                task,
            });
            ready_rx
        };

        match tokio::time::timeout_at(deadline, ready).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                self.reap().await;
                Err(e)
            }
            Ok(Err(_)) => {
                self.reap().await;
                Err(GatewayError::new(GatewayErrorKind::Shutdown))
            }
            Err(_) => {
                warn!("Session not ready before deadline, stopping");
                let _ = self.stop(Instant::now() + self.inner.config.connect_timeout()).await;
                Err(GatewayError::new(GatewayErrorKind::DeadlineExceeded))
            }
        }
    }

    /// Close the connection with 1000 and stop reconnecting. The session is
    /// discarded; the next `connect` identifies afresh.
    ///
    /// # Errors
    ///
    /// - `NotConnected` if the session is not running
    /// - `DeadlineExceeded` if the supervisor did not stop within the
    ///   connect timeout; it is aborted
    pub async fn disconnect(&self) -> GatewayResult<()> {
        let deadline = Instant::now() + self.inner.config.connect_timeout();
        self.disconnect_with_deadline(deadline).await
    }

    /// [`disconnect`](Self::disconnect) with an explicit deadline.
    ///
    /// # Errors
    ///
    /// See [`disconnect`](Self::disconnect).
    #[instrument(skip(self), fields(shard = %self.inner.shard))]
    pub async fn disconnect_with_deadline(&self, deadline: Instant) -> GatewayResult<()> {
        self.stop(deadline).await
    }

    /// Send a caller command on the live connection, within the
    /// per-connection command budget.
    ///
    /// # Errors
    ///
    /// - `NotConnected` if there is no live connection
    /// - `Transport` if the write fails
    #[instrument(skip(self, command), fields(shard = %self.inner.shard, op = %command.opcode()))]
    pub async fn send_command(&self, command: Command) -> GatewayResult<()> {
        let channel = self.inner.commands.lock().clone();
        let Some(channel) = channel else {
            return Err(GatewayError::new(GatewayErrorKind::NotConnected));
        };
        channel.limiter.acquire().await;
        send_payload(&channel.sink, &ClientPayload::Command(command)).await
    }

    /// Wait for a supervisor that has already decided to exit.
    async fn reap(&self) {
        let running = self.inner.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.task.await;
        }
    }

    async fn stop(&self, deadline: Instant) -> GatewayResult<()> {
        let running = self.inner.running.lock().await.take();
        let Some(running) = running else {
            return Err(GatewayError::new(GatewayErrorKind::NotConnected));
        };
        let was_running = !running.task.is_finished();
        let _ = running.shutdown.send(true);

        let mut task = running.task;
        let joined = tokio::time::timeout_at(deadline, &mut task).await.is_ok();
        if !joined {
            warn!("Supervisor did not stop in time, aborting");
            task.abort();
            self.inner.emit(LifecycleEvent::Disconnected { requested: true });
        }

        *self.inner.commands.lock() = None;
        {
            let mut state = self.inner.state.lock();
            state.heartbeat = None;
            state.clear_session();
            state.phase = SessionPhase::Disconnected;
        }

        if !was_running {
            return Err(GatewayError::new(GatewayErrorKind::NotConnected));
        }
        if !joined {
            return Err(GatewayError::new(GatewayErrorKind::DeadlineExceeded));
        }
        info!("Session disconnected");
        Ok(())
    }
}

/// How one connection ended.
#[derive(Debug)]
enum Outcome {
    Shutdown,
    Reconnect { resume: bool, immediate: bool },
    Invalidated,
    Fatal { code: u16, reason: String },
}

#[derive(Debug)]
enum HeartbeatFailure {
    Zombie { missed: u32 },
    Transport(GatewayError),
}

enum Step {
    Shutdown,
    TimedOut,
    Heartbeat(Option<HeartbeatFailure>),
    Frame(Option<GatewayResult<WireMessage>>),
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Resolves once shutdown is requested or the session handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn send_payload(sink: &SharedSink, payload: &ClientPayload) -> GatewayResult<()> {
    let text = payload.to_json()?;
    sink.lock().await.send(WireMessage::Text(text)).await
}

async fn close_with(sink: &SharedSink, code: u16, outcome: Outcome) -> Outcome {
    if let Err(e) = sink.lock().await.close(code, close_code::describe(code)).await {
        debug!(code, error = %e, "Close frame not sent");
    }
    outcome
}

const RECONNECT: Outcome = Outcome::Reconnect {
    resume: true,
    immediate: false,
};

struct Supervisor {
    inner: Arc<SessionInner>,
    credentials: Credentials,
    shutdown: watch::Receiver<bool>,
    ready: Option<oneshot::Sender<GatewayResult<()>>>,
    backoff: Backoff,
    attempt: u32,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let outcome = self.run_connection().await;
            *self.inner.commands.lock() = None;
            self.inner.state.lock().heartbeat = None;

            match outcome {
                Outcome::Shutdown => {
                    self.inner.set_phase(SessionPhase::Disconnected);
                    self.inner.emit(LifecycleEvent::Disconnected { requested: true });
                    return;
                }
                Outcome::Fatal { code, reason } => {
                    warn!(code, %reason, meaning = close_code::describe(code), "Fatal close, not reconnecting");
                    {
                        let mut state = self.inner.state.lock();
                        state.clear_session();
                        state.phase = SessionPhase::Disconnected;
                    }
                    self.inner.emit(LifecycleEvent::Fatal {
                        code,
                        reason: reason.clone(),
                    });
                    self.inner.emit(LifecycleEvent::Disconnected { requested: false });
                    self.fail(GatewayError::new(GatewayErrorKind::Fatal { code, reason }));
                    return;
                }
                Outcome::Invalidated => {
                    {
                        let mut state = self.inner.state.lock();
                        state.clear_session();
                        state.phase = SessionPhase::Invalidated;
                    }
                    info!("Session invalidated, waiting for a new connect");
                    self.fail(GatewayError::new(GatewayErrorKind::SessionInvalidated {
                        resumable: false,
                    }));
                    return;
                }
                Outcome::Reconnect { resume, immediate } => {
                    self.attempt += 1;
                    let resume = {
                        let mut state = self.inner.state.lock();
                        if !resume {
                            state.clear_session();
                        }
                        state.phase = SessionPhase::Connecting;
                        state.can_resume()
                    };
                    let delay = if immediate {
                        Duration::ZERO
                    } else {
                        self.backoff.next_delay()
                    };
                    warn!(attempt = self.attempt, resume, ?delay, "Reconnecting");
                    self.inner.emit(LifecycleEvent::Reconnecting {
                        attempt: self.attempt,
                        resume,
                    });

                    if !delay.is_zero() {
                        let stopped = tokio::select! {
                            _ = tokio::time::sleep(delay) => false,
                            _ = shutdown_requested(&mut self.shutdown) => true,
                        };
                        if stopped {
                            self.inner.set_phase(SessionPhase::Disconnected);
                            self.inner.emit(LifecycleEvent::Disconnected { requested: true });
                            return;
                        }
                    }
                }
            }
        }
    }

    fn fail(&mut self, error: GatewayError) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(error));
        }
    }

    fn established(&mut self, resumed: bool) {
        self.inner.set_phase(SessionPhase::Connected);
        self.backoff.reset();
        self.attempt = 0;
        self.inner.emit(LifecycleEvent::Connected { resumed });
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }
    }

    async fn run_connection(&mut self) -> Outcome {
        let (resume, url) = {
            let state = self.inner.state.lock();
            let resume = state.can_resume();
            let base = if resume { state.resume_url.as_deref() } else { None };
            (resume, self.inner.config.connection_url(base))
        };
        self.inner.set_phase(SessionPhase::Connecting);
        info!(%url, resume, "Connecting to gateway");

        let connected = tokio::select! {
            result = self.inner.connector.connect(&url) => Some(result),
            _ = shutdown_requested(&mut self.shutdown) => None,
        };
        let Connection { sink, mut stream } = match connected {
            None => return Outcome::Shutdown,
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                warn!(error = %e, "Gateway connect failed");
                return RECONNECT;
            }
        };
        let sink: SharedSink = Arc::new(AsyncMutex::new(sink));
        let mut codec = FrameCodec::new(self.inner.config.compression);

        // Hello comes first; anything else before it is ignored.
        let hello_deadline = Instant::now() + self.inner.config.hello_timeout();
        let interval = loop {
            let step = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => Step::Shutdown,
                frame = tokio::time::timeout_at(hello_deadline, stream.next()) => match frame {
                    Ok(frame) => Step::Frame(frame),
                    Err(_) => Step::TimedOut,
                },
            };
            match step {
                Step::Shutdown => return close_with(&sink, NORMAL_CLOSURE, Outcome::Shutdown).await,
                Step::TimedOut => {
                    warn!("No Hello before deadline");
                    return close_with(&sink, RESUME_CLOSURE, RECONNECT).await;
                }
                Step::Heartbeat(_) => {}
                Step::Frame(None) => {
                    warn!("Connection dropped before Hello");
                    return RECONNECT;
                }
                Step::Frame(Some(Err(e))) => {
                    warn!(error = %e, "Read failed before Hello");
                    return RECONNECT;
                }
                Step::Frame(Some(Ok(WireMessage::Close { code, reason }))) => {
                    return on_close(code, reason);
                }
                Step::Frame(Some(Ok(message))) => match codec.decode(&message) {
                    Ok(Some(ServerPayload::Hello(hello))) if hello.heartbeat_interval > 0 => {
                        break Duration::from_millis(hello.heartbeat_interval);
                    }
                    Ok(Some(other)) => debug!(op = %other.opcode(), "Ignoring frame before Hello"),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e.error(), "Undecodable frame before Hello");
                        return close_with(&sink, RESUME_CLOSURE, RECONNECT).await;
                    }
                },
            }
        };

        let monitor = HeartbeatMonitor::new(interval, self.inner.config.heartbeat_miss_tolerance);
        let first = monitor.first_delay(self.inner.config.heartbeat_jitter);
        self.inner.state.lock().heartbeat = Some(monitor);
        debug!(?interval, ?first, "Hello received, starting heartbeat");
        let (failure_tx, mut failure_rx) = oneshot::channel();
        let _heartbeat = AbortOnDrop(tokio::spawn(
            heartbeat_loop(Arc::clone(&self.inner), Arc::clone(&sink), first, interval, failure_tx)
                .in_current_span(),
        ));

        let handshake = if resume {
            self.inner.set_phase(SessionPhase::Resuming);
            let (session_id, seq) = {
                let state = self.inner.state.lock();
                (
                    state.session_id.clone().unwrap_or_default(),
                    state.sequence.unwrap_or(0),
                )
            };
            info!(%session_id, seq, "Resuming session");
            ClientPayload::Resume(Resume {
                token: self.credentials.token().clone(),
                session_id,
                seq,
            })
        } else {
            self.inner.set_phase(SessionPhase::Identifying);
            let shard = self.inner.shard;
            let proceed = tokio::select! {
                _ = self.inner.identify.acquire(shard.index) => true,
                _ = shutdown_requested(&mut self.shutdown) => false,
            };
            if !proceed {
                return close_with(&sink, NORMAL_CLOSURE, Outcome::Shutdown).await;
            }
            info!(shard = %shard, "Identifying");
            ClientPayload::Identify(Identify {
                token: self.credentials.token().clone(),
                intents: *self.credentials.intents(),
                properties: ConnectionProperties::default(),
                shard: [shard.index, shard.count],
                large_threshold: self.inner.config.large_threshold,
                compress: false,
                presence: None,
            })
        };
        if let Err(e) = send_payload(&sink, &handshake).await {
            warn!(error = %e, op = %handshake.opcode(), "Handshake send failed");
            return RECONNECT;
        }

        *self.inner.commands.lock() = Some(CommandChannel {
            sink: Arc::clone(&sink),
            limiter: Arc::new(CommandLimiter::new(self.inner.config.commands_per_minute)),
        });

        loop {
            let step = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => Step::Shutdown,
                failure = &mut failure_rx => Step::Heartbeat(failure.ok()),
                frame = stream.next() => Step::Frame(frame),
            };
            match step {
                Step::Shutdown => return close_with(&sink, NORMAL_CLOSURE, Outcome::Shutdown).await,
                Step::TimedOut => {}
                Step::Heartbeat(Some(HeartbeatFailure::Zombie { missed })) => {
                    warn!(missed, "Heartbeat acks missing, connection is a zombie");
                    return close_with(
                        &sink,
                        RESUME_CLOSURE,
                        Outcome::Reconnect {
                            resume: true,
                            immediate: true,
                        },
                    )
                    .await;
                }
                Step::Heartbeat(Some(HeartbeatFailure::Transport(e))) => {
                    warn!(error = %e, "Heartbeat send failed");
                    return close_with(&sink, RESUME_CLOSURE, RECONNECT).await;
                }
                Step::Heartbeat(None) => {
                    warn!("Heartbeat task stopped");
                    return close_with(&sink, RESUME_CLOSURE, RECONNECT).await;
                }
                Step::Frame(None) => {
                    warn!("Connection dropped");
                    return RECONNECT;
                }
                Step::Frame(Some(Err(e))) => {
                    warn!(error = %e, "Read failed");
                    return RECONNECT;
                }
                Step::Frame(Some(Ok(WireMessage::Close { code, reason }))) => {
                    return on_close(code, reason);
                }
                Step::Frame(Some(Ok(message))) => match codec.decode(&message) {
                    Ok(None) => {}
                    Ok(Some(payload)) => {
                        if let Some(outcome) = self.handle(payload, &sink).await {
                            return outcome;
                        }
                    }
                    Err(PayloadError::Event { sequence, error }) => {
                        self.inner.state.lock().observe_sequence(sequence);
                        warn!(error = %error, ?sequence, "Dropping undecodable event");
                    }
                    Err(PayloadError::Control(error)) => {
                        warn!(error = %error, "Undecodable control frame, reconnecting");
                        return close_with(&sink, RESUME_CLOSURE, RECONNECT).await;
                    }
                },
            }
        }
    }

    async fn handle(&mut self, payload: ServerPayload, sink: &SharedSink) -> Option<Outcome> {
        match payload {
            ServerPayload::Dispatch(dispatch) => {
                self.on_dispatch(dispatch);
                None
            }
            ServerPayload::Heartbeat => {
                let seq = {
                    let mut state = self.inner.state.lock();
                    if let Some(monitor) = state.heartbeat.as_mut() {
                        monitor.record_sent(Instant::now());
                    }
                    state.sequence
                };
                debug!(?seq, "Server requested heartbeat");
                match send_payload(sink, &ClientPayload::Heartbeat(seq)).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(error = %e, "Heartbeat send failed");
                        Some(RECONNECT)
                    }
                }
            }
            ServerPayload::HeartbeatAck => {
                let mut state = self.inner.state.lock();
                if let Some(monitor) = state.heartbeat.as_mut() {
                    monitor.record_ack(Instant::now());
                    trace!(latency = ?monitor.latency(), "Heartbeat acknowledged");
                }
                None
            }
            ServerPayload::Reconnect => {
                info!("Server requested reconnect");
                Some(
                    close_with(
                        sink,
                        RESUME_CLOSURE,
                        Outcome::Reconnect {
                            resume: true,
                            immediate: true,
                        },
                    )
                    .await,
                )
            }
            ServerPayload::InvalidSession { resumable } => {
                warn!(resumable, "Server invalidated the session");
                self.inner.emit(LifecycleEvent::Invalidated { resumable });

                let stopped = tokio::select! {
                    _ = tokio::time::sleep(self.inner.config.invalid_session_delay()) => false,
                    _ = shutdown_requested(&mut self.shutdown) => true,
                };
                if stopped {
                    return Some(close_with(sink, NORMAL_CLOSURE, Outcome::Shutdown).await);
                }
                if resumable {
                    return Some(
                        close_with(
                            sink,
                            RESUME_CLOSURE,
                            Outcome::Reconnect {
                                resume: true,
                                immediate: true,
                            },
                        )
                        .await,
                    );
                }

                self.inner.state.lock().clear_session();
                let outcome = if self.inner.config.reidentify_on_invalid_session {
                    Outcome::Reconnect {
                        resume: false,
                        immediate: true,
                    }
                } else {
                    Outcome::Invalidated
                };
                Some(close_with(sink, NORMAL_CLOSURE, outcome).await)
            }
            ServerPayload::Hello(_) => {
                debug!("Ignoring repeated Hello");
                None
            }
        }
    }

    fn on_dispatch(&mut self, dispatch: Dispatch) {
        let Dispatch {
            op,
            sequence,
            event,
            data,
        } = dispatch;
        self.inner.state.lock().observe_sequence(sequence);

        match event.as_str() {
            _ if op != OpCode::Dispatch.code() => {
                debug!(op, event = %event, seq = ?sequence, "Forwarding unmodelled opcode");
            }
            "READY" => match Ready::deserialize(&data) {
                Ok(ready) => {
                    info!(session_id = %ready.session_id, "Session ready");
                    {
                        let mut state = self.inner.state.lock();
                        state.session_id = Some(ready.session_id);
                        state.resume_url = ready.resume_gateway_url;
                    }
                    self.established(false);
                }
                Err(e) => warn!(error = %e, "READY without session fields"),
            },
            "RESUMED" => {
                info!(seq = ?sequence, "Session resumed");
                self.established(true);
            }
            _ => trace!(event = %event, seq = ?sequence, "Dispatch"),
        }

        self.inner
            .events
            .publish(GatewayEvent::new(event, sequence, self.inner.shard.index, data));
    }
}

fn on_close(code: Option<u16>, reason: String) -> Outcome {
    let Some(code) = code else {
        warn!("Server closed without a code");
        return RECONNECT;
    };
    let meaning = close_code::describe(code);
    match close_code::classify(code) {
        CloseAction::Fatal => Outcome::Fatal { code, reason },
        CloseAction::Reidentify => {
            warn!(code, meaning, %reason, "Server ended the session");
            Outcome::Reconnect {
                resume: false,
                immediate: false,
            }
        }
        CloseAction::Resume => {
            warn!(code, meaning, %reason, "Server closed the connection");
            RECONNECT
        }
    }
}

async fn heartbeat_loop(
    inner: Arc<SessionInner>,
    sink: SharedSink,
    first: Duration,
    interval: Duration,
    failure: oneshot::Sender<HeartbeatFailure>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + first, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let (beat, seq) = {
            let mut state = inner.state.lock();
            let seq = state.sequence;
            let Some(monitor) = state.heartbeat.as_mut() else {
                return;
            };
            let beat = monitor.on_tick();
            if beat == Beat::Send {
                monitor.record_sent(Instant::now());
            }
            (beat, seq)
        };

        match beat {
            Beat::Zombie { missed } => {
                let _ = failure.send(HeartbeatFailure::Zombie { missed });
                return;
            }
            Beat::Send => {
                trace!(?seq, "Sending heartbeat");
                if let Err(e) = send_payload(&sink, &ClientPayload::Heartbeat(seq)).await {
                    let _ = failure.send(HeartbeatFailure::Transport(e));
                    return;
                }
            }
        }
    }
}
