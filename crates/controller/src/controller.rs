// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Manager Contributors

//! Connection controller
//!
//! Owns the single session slot. `connect()` reserves the slot, runs the
//! permission check, starts the helper and hands the process to a session
//! task. From then on everything is reported through events and `status()`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use openvpn_manager_common::{
    ConnectionState, ControllerEvent, Credentials, ErrorKind, LogLine, PermissionReport,
    SessionError, SessionSnapshot, Utc, Uuid, VpnConfig,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::classifier::MarkerTable;
use crate::config::ControllerConfig;
use crate::credentials::{CredentialStore, DeleteOutcome, StoreError};
use crate::machine::{Action, NotAwaiting, SessionMachine};
use crate::permissions::PermissionVerifier;
use crate::sink::FileLogSink;
use crate::supervisor::{ExitStatus, OutputLine, ProcessHandle, ProcessSupervisor};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const LOG_CHANNEL_CAPACITY: usize = 1024;
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Output still queued when the process exits is read for at most this long
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("A VPN connection is already active")]
    AlreadyConnected,

    #[error("{remediation}")]
    PermissionDenied { remediation: String },

    #[error("Failed to start the VPN helper: {0}")]
    Spawn(String),

    #[error("No active VPN session")]
    NoActiveSession,

    #[error("Session is not waiting for credentials (state: {0})")]
    NotAwaitingCredentials(ConnectionState),

    #[error("VPN client did not stop within the grace period and was killed")]
    StopTimeout,

    #[error("{message}")]
    SessionFailed { kind: ErrorKind, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid controller configuration: {0}")]
    Config(String),
}

impl ControllerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::AlreadyConnected => ErrorKind::AlreadyConnected,
            ControllerError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            ControllerError::Spawn(_) => ErrorKind::SpawnError,
            ControllerError::NoActiveSession | ControllerError::NotAwaitingCredentials(_) => {
                ErrorKind::NoActiveSession
            }
            ControllerError::StopTimeout => ErrorKind::StopTimeout,
            ControllerError::SessionFailed { kind, .. } => *kind,
            ControllerError::Store(_) => ErrorKind::StoreUnavailable,
            ControllerError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Arguments of `connect()`
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub config: VpnConfig,
    /// Used for the first prompt; otherwise the store is asked, then the caller
    pub credentials: Option<Credentials>,
    /// Store the credentials once the tunnel is up
    pub save_credentials: bool,
}

impl ConnectRequest {
    pub fn new(config: VpnConfig) -> Self {
        Self {
            config,
            credentials: None,
            save_credentials: false,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials, save: bool) -> Self {
        self.credentials = Some(credentials);
        self.save_credentials = save;
        self
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub state: ConnectionState,
    pub exit: ExitStatus,
    pub error: Option<SessionError>,
}

impl SessionOutcome {
    /// The process had to be killed after the grace period
    pub fn forced(&self) -> bool {
        self.exit.forced
    }
}

enum SessionCommand {
    ProvideCredentials {
        credentials: Credentials,
        save: bool,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
}

struct ActiveSession {
    snapshot: SessionSnapshot,
    commands: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    done: watch::Receiver<Option<SessionOutcome>>,
}

/// Zero or one session
enum Slot {
    Empty,
    /// `connect()` is running its checks
    Reserved,
    /// Announced as `Connecting`, helper not handed to a runner yet
    Starting(SessionSnapshot),
    Active(ActiveSession),
}

struct Inner {
    config: ControllerConfig,
    markers: MarkerTable,
    verifier: PermissionVerifier,
    supervisor: ProcessSupervisor,
    store: Arc<dyn CredentialStore>,
    slot: Mutex<Slot>,
    last_outcome: Mutex<Option<SessionOutcome>>,
    event_tx: broadcast::Sender<ControllerEvent>,
    log_tx: broadcast::Sender<LogLine>,
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ControllerEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("No subscribers for controller event");
        }
    }

    fn emit_log(&self, line: LogLine) {
        let _ = self.log_tx.send(line);
    }

    fn update_snapshot(&self, session_id: Uuid, update: impl FnOnce(&mut SessionSnapshot)) {
        if let Slot::Active(session) = &mut *self.slot() {
            if session.snapshot.session_id == session_id {
                update(&mut session.snapshot);
            }
        }
    }
}

/// Frees the slot if `connect()` fails or is dropped before the session starts
struct Reservation {
    inner: Arc<Inner>,
    armed: bool,
}

impl Reservation {
    /// Make the session visible to `status()` before it is committed
    fn announce(&self, snapshot: &SessionSnapshot) {
        *self.inner.slot() = Slot::Starting(snapshot.clone());
    }

    fn commit(mut self, session: ActiveSession) {
        *self.inner.slot() = Slot::Active(session);
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = self.inner.slot();
            if matches!(*slot, Slot::Reserved | Slot::Starting(_)) {
                *slot = Slot::Empty;
            }
        }
    }
}

/// Manages the one VPN connection
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<Inner>,
}

impl ConnectionController {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, ControllerError> {
        config
            .validate()
            .map_err(|e| ControllerError::Config(format!("{:#}", e)))?;

        let markers = config.marker_table();
        let supervisor = ProcessSupervisor::new(
            config.helper(),
            markers.prompt_patterns(),
            config.max_line_length,
            config.output_buffer_lines,
        );
        let verifier = PermissionVerifier::from_config(&config);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (log_tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                markers,
                verifier,
                supervisor,
                store,
                slot: Mutex::new(Slot::Empty),
                last_outcome: Mutex::new(None),
                event_tx,
                log_tx,
            }),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Subscribe to VPN client output, separate from the state events
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.inner.log_tx.subscribe()
    }

    /// Probe the privilege policy for the configured helper; never cached
    pub async fn check_permissions(&self) -> PermissionReport {
        self.inner.verifier.check(&self.inner.config.helper_path).await
    }

    /// Snapshot of the current session, if any
    pub fn status(&self) -> Option<SessionSnapshot> {
        match &*self.inner.slot() {
            Slot::Active(session) => Some(session.snapshot.clone()),
            Slot::Starting(snapshot) => Some(snapshot.clone()),
            Slot::Empty | Slot::Reserved => None,
        }
    }

    /// How the most recent session ended
    ///
    /// Lets a subscriber that fell behind find the final state once
    /// `status()` is `None`.
    pub fn last_outcome(&self) -> Option<SessionOutcome> {
        self.inner
            .last_outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start a session
    ///
    /// Returns once the helper is running; later progress and failures are
    /// reported as events.
    pub async fn connect(&self, request: ConnectRequest) -> Result<SessionSnapshot, ControllerError> {
        let reservation = self.reserve()?;
        let ConnectRequest {
            config,
            credentials,
            save_credentials,
        } = request;
        info!("Connecting with configuration '{}'", config.id);

        let report = self.check_permissions().await;
        if !report.ok {
            warn!(
                "Not starting {}: no passwordless sudo rule for the current user",
                report.helper_path
            );
            self.inner.emit(ControllerEvent::Error {
                session_id: None,
                kind: ErrorKind::PermissionDenied,
                message: report.remediation_text.clone(),
                timestamp: Utc::now(),
            });
            return Err(ControllerError::PermissionDenied {
                remediation: report.remediation_text,
            });
        }

        let session_id = Uuid::new_v4();
        let mut snapshot = SessionSnapshot {
            session_id,
            config_id: config.id.clone(),
            config_name: config.name.clone(),
            state: ConnectionState::Idle,
            assigned_interface: None,
            assigned_address: None,
            last_error: None,
            started_at: Utc::now(),
        };
        let mut machine = SessionMachine::new(
            config.id.clone(),
            self.inner.markers.clone(),
            self.inner.config.stderr_tail_lines,
            credentials,
            save_credentials,
        );

        // Connecting is announced before the helper produces any output,
        // and status() already reports it when subscribers see the event
        let started = machine.start();
        for action in &started {
            if let Action::Transition(state) = action {
                snapshot.state = *state;
            }
        }
        reservation.announce(&snapshot);
        for action in started {
            if let Action::Transition(state) = action {
                self.inner.emit(state_changed(session_id, state));
            }
        }

        let mut handle = match self.inner.supervisor.start(&config.path, &[]) {
            Ok(handle) => handle,
            Err(e) => {
                error!("{}", e);
                let message = e.to_string();
                for action in machine.fail(ErrorKind::SpawnError, message.clone()) {
                    match action {
                        Action::Transition(state) => {
                            snapshot.state = state;
                            reservation.announce(&snapshot);
                            self.inner.emit(state_changed(session_id, state))
                        }
                        Action::Error { kind, message } => {
                            snapshot.last_error = Some(SessionError {
                                kind,
                                message: message.clone(),
                            });
                            reservation.announce(&snapshot);
                            self.inner.emit(ControllerEvent::Error {
                                session_id: Some(session_id),
                                kind,
                                message,
                                timestamp: Utc::now(),
                            })
                        }
                        _ => {}
                    }
                }
                return Err(ControllerError::Spawn(message));
            }
        };
        let output = handle
            .take_output()
            .ok_or_else(|| ControllerError::Spawn("helper output is not available".to_string()))?;

        let sink = self.inner.config.session_log().and_then(|path| {
            match FileLogSink::create(path, &config.name) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    warn!("Session log disabled: {:#}", e);
                    None
                }
            }
        });

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        reservation.commit(ActiveSession {
            snapshot: snapshot.clone(),
            commands: command_tx,
            cancel: cancel.clone(),
            done: done_rx,
        });

        let runner = SessionRunner {
            inner: self.inner.clone(),
            session_id,
            config_id: config.id,
            machine,
            handle,
            sink,
            auth_deadline: None,
            lookup: None,
            terminate: false,
            last_error: None,
        };
        tokio::spawn(runner.run(output, command_rx, cancel, done_tx));

        Ok(snapshot)
    }

    /// Answer a pending `CredentialsRequired`
    pub async fn provide_credentials(
        &self,
        credentials: Credentials,
        save: bool,
    ) -> Result<(), ControllerError> {
        let commands = match &*self.inner.slot() {
            Slot::Active(session) => session.commands.clone(),
            Slot::Empty | Slot::Reserved | Slot::Starting(_) => {
                return Err(ControllerError::NoActiveSession)
            }
        };

        let (reply, response) = oneshot::channel();
        commands
            .send(SessionCommand::ProvideCredentials {
                credentials,
                save,
                reply,
            })
            .await
            .map_err(|_| ControllerError::NoActiveSession)?;
        response
            .await
            .map_err(|_| ControllerError::NoActiveSession)?
    }

    /// Stop the session and wait until it is `Disconnected`
    ///
    /// A no-op without a session. `StopTimeout` means the process had to be
    /// killed; the session has still ended.
    pub async fn disconnect(&self) -> Result<(), ControllerError> {
        let (cancel, done) = match &*self.inner.slot() {
            Slot::Active(session) => (session.cancel.clone(), session.done.clone()),
            Slot::Empty | Slot::Reserved | Slot::Starting(_) => {
                debug!("disconnect() without an active session");
                return Ok(());
            }
        };

        info!("Disconnecting");
        cancel.cancel();

        match wait_outcome(done).await {
            Some(outcome) if outcome.forced() => Err(ControllerError::StopTimeout),
            Some(SessionOutcome {
                state: ConnectionState::Failed(kind),
                error,
                ..
            }) => Err(ControllerError::SessionFailed {
                kind,
                message: error
                    .map(|e| e.message)
                    .unwrap_or_else(|| kind.to_string()),
            }),
            _ => Ok(()),
        }
    }

    /// Wait for the current session to end on its own
    pub async fn wait_for_session_end(&self) -> Option<SessionOutcome> {
        let done = match &*self.inner.slot() {
            Slot::Active(session) => session.done.clone(),
            Slot::Empty | Slot::Reserved | Slot::Starting(_) => return None,
        };
        wait_outcome(done).await
    }

    /// Remove stored credentials for a configuration
    pub async fn forget_credentials(&self, config_id: &str) -> Result<DeleteOutcome, ControllerError> {
        Ok(self.inner.store.delete(config_id).await?)
    }

    fn reserve(&self) -> Result<Reservation, ControllerError> {
        let mut slot = self.inner.slot();
        if !matches!(*slot, Slot::Empty) {
            warn!("connect() refused: a session is already active");
            return Err(ControllerError::AlreadyConnected);
        }
        *slot = Slot::Reserved;
        Ok(Reservation {
            inner: self.inner.clone(),
            armed: true,
        })
    }
}

async fn wait_outcome(mut done: watch::Receiver<Option<SessionOutcome>>) -> Option<SessionOutcome> {
    let outcome = done.wait_for(Option::is_some).await.ok()?;
    (*outcome).clone()
}

fn state_changed(session_id: Uuid, state: ConnectionState) -> ControllerEvent {
    ControllerEvent::StateChanged {
        session_id,
        state,
        timestamp: Utc::now(),
    }
}

/// The task driving one session from spawn to teardown
struct SessionRunner {
    inner: Arc<Inner>,
    session_id: Uuid,
    config_id: String,
    machine: SessionMachine,
    handle: ProcessHandle,
    sink: Option<FileLogSink>,
    auth_deadline: Option<Instant>,
    /// Outstanding secret store lookup
    lookup: Option<JoinHandle<Result<Option<Credentials>, StoreError>>>,
    /// The machine asked for the process to be stopped
    terminate: bool,
    last_error: Option<SessionError>,
}

impl SessionRunner {
    async fn run(
        mut self,
        mut output: mpsc::Receiver<OutputLine>,
        mut commands: mpsc::Receiver<SessionCommand>,
        cancel: CancellationToken,
        done_tx: watch::Sender<Option<SessionOutcome>>,
    ) {
        let mut output_open = true;

        let status = loop {
            let deadline = self.auth_deadline;
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let actions = self.machine.on_stop_requested();
                    self.apply(actions).await;
                    break self.stop_process(&mut output).await;
                }

                line = output.recv(), if output_open => match line {
                    Some(line) => {
                        let actions = self.machine.on_line(line.stream, &line.text);
                        self.apply(actions).await;
                    }
                    None => output_open = false,
                },

                status = self.handle.wait() => {
                    self.drain(&mut output).await;
                    break status;
                }

                Some(command) = commands.recv() => self.on_command(command).await,

                result = stored_credentials(&mut self.lookup, &self.config_id), if self.lookup.is_some() => {
                    self.lookup = None;
                    let actions = self.machine.on_stored_credentials(result);
                    self.apply(actions).await;
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.auth_deadline = None;
                    warn!("No credentials for '{}' within the timeout", self.config_id);
                    let actions = self.machine.on_auth_timeout();
                    self.apply(actions).await;
                }
            }

            if self.terminate {
                break self.stop_process(&mut output).await;
            }
        };

        let actions = self.machine.on_exit(status);
        self.apply(actions).await;
        self.finish(status, done_tx);
    }

    /// Helper `stop` first, then the signal sequence
    async fn stop_process(&mut self, output: &mut mpsc::Receiver<OutputLine>) -> ExitStatus {
        self.abort_lookup();
        let grace = self.inner.config.stop_grace();
        if !self.handle.has_exited() {
            if let Some(pid) = self.handle.pid() {
                self.inner.supervisor.helper().request_stop(pid, grace).await;
            }
        }
        let status = self.handle.stop(grace).await;
        self.drain(output).await;
        status
    }

    fn abort_lookup(&mut self) {
        if let Some(task) = self.lookup.take() {
            debug!("Abandoning stored credentials lookup for '{}'", self.config_id);
            task.abort();
        }
    }

    /// Classify whatever output is still queued, in order
    async fn drain(&mut self, output: &mut mpsc::Receiver<OutputLine>) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, output.recv()).await {
                Ok(Some(line)) => {
                    let actions = self.machine.on_line(line.stream, &line.text);
                    self.apply(actions).await;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("Output still open after the process exited");
                    break;
                }
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ProvideCredentials {
                credentials,
                save,
                reply,
            } => match self.machine.on_credentials(credentials, save) {
                Ok(actions) => {
                    self.apply(actions).await;
                    let _ = reply.send(Ok(()));
                }
                Err(NotAwaiting(state)) => {
                    let _ = reply.send(Err(ControllerError::NotAwaitingCredentials(state)));
                }
            },
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Transition(state) => {
                    if state != ConnectionState::Authenticating {
                        self.auth_deadline = None;
                    }
                    self.inner
                        .update_snapshot(self.session_id, |s| s.state = state);
                    self.inner.emit(state_changed(self.session_id, state));
                }
                Action::Log { stream, line } => {
                    if let Some(sink) = &mut self.sink {
                        sink.write_line(stream, &line);
                    }
                    self.inner.emit_log(LogLine {
                        session_id: self.session_id,
                        stream,
                        line,
                        timestamp: Utc::now(),
                    });
                }
                Action::AuthenticationRequired => {
                    self.inner.emit(ControllerEvent::AuthenticationRequired {
                        session_id: self.session_id,
                        config_id: self.config_id.clone(),
                        timestamp: Utc::now(),
                    });
                }
                Action::LookupStoredCredentials => {
                    // Resolved by the run loop, next to cancellation
                    let store = self.inner.store.clone();
                    let config_id = self.config_id.clone();
                    let limit = self.inner.config.auth_timeout();
                    self.lookup = Some(tokio::spawn(async move {
                        let result = tokio::time::timeout(limit, store.get(&config_id)).await;
                        result.unwrap_or_else(|_| Err(StoreError::Unavailable { config_id }))
                    }));
                }
                Action::RequestCredentials => {
                    info!("Waiting for credentials for '{}'", self.config_id);
                    self.auth_deadline = Some(Instant::now() + self.inner.config.auth_timeout());
                    self.inner.emit(ControllerEvent::CredentialsRequired {
                        session_id: self.session_id,
                        config_id: self.config_id.clone(),
                        timestamp: Utc::now(),
                    });
                }
                Action::Answer(prompt) => {
                    self.auth_deadline = None;
                    let Some(text) = self.machine.answer(prompt).map(|t| Zeroizing::new(t.to_string()))
                    else {
                        continue;
                    };
                    match self.handle.write_line(&text).await {
                        Ok(()) => debug!("Answered {:?} prompt", prompt),
                        Err(e) => {
                            warn!("Failed to answer {:?} prompt: {}", prompt, e);
                            for action in self.machine.on_write_failed().into_iter().rev() {
                                queue.push_front(action);
                            }
                        }
                    }
                }
                Action::Established { interface, address } => {
                    info!(
                        "Tunnel up for '{}' (interface {}, address {})",
                        self.config_id,
                        interface.as_deref().unwrap_or("unknown"),
                        address.as_deref().unwrap_or("unknown")
                    );
                    self.inner.update_snapshot(self.session_id, |s| {
                        s.assigned_interface = interface.clone();
                        s.assigned_address = address.clone();
                    });
                    self.inner.emit(ControllerEvent::Connected {
                        session_id: self.session_id,
                        interface,
                        address,
                        timestamp: Utc::now(),
                    });
                }
                Action::PersistCredentials(credentials) => {
                    // Failing to save never fails the session
                    if let Err(e) = self.inner.store.put(&credentials).await {
                        warn!("Could not save credentials: {}", e);
                        self.inner.emit(ControllerEvent::Error {
                            session_id: Some(self.session_id),
                            kind: ErrorKind::StoreUnavailable,
                            message: e.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                }
                Action::Terminate => self.terminate = true,
                Action::Error { kind, message } => {
                    warn!("Session '{}' error ({}): {}", self.config_id, kind, message);
                    let session_error = SessionError {
                        kind,
                        message: message.clone(),
                    };
                    self.inner.update_snapshot(self.session_id, |s| {
                        s.last_error = Some(session_error.clone());
                    });
                    self.last_error = Some(session_error);
                    self.inner.emit(ControllerEvent::Error {
                        session_id: Some(self.session_id),
                        kind,
                        message,
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    /// Tear down exactly once: notify, release the process, free the slot
    fn finish(mut self, exit: ExitStatus, done_tx: watch::Sender<Option<SessionOutcome>>) {
        self.abort_lookup();
        let state = self.machine.state();
        if state == ConnectionState::Disconnected {
            self.inner.emit(ControllerEvent::Disconnected {
                session_id: self.session_id,
                timestamp: Utc::now(),
            });
        }
        info!("Session for '{}' ended: {} ({})", self.config_id, state, exit);

        let SessionRunner {
            inner,
            session_id,
            handle,
            last_error,
            ..
        } = self;
        drop(handle);

        let outcome = SessionOutcome {
            session_id,
            state,
            exit,
            error: last_error,
        };
        *inner.last_outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome.clone());

        {
            let mut slot = inner.slot();
            if matches!(&*slot, Slot::Active(s) if s.snapshot.session_id == session_id) {
                *slot = Slot::Empty;
            }
        }

        done_tx.send_replace(Some(outcome));
    }
}

async fn stored_credentials(
    lookup: &mut Option<JoinHandle<Result<Option<Credentials>, StoreError>>>,
    config_id: &str,
) -> Result<Option<Credentials>, StoreError> {
    let Some(task) = lookup else {
        return std::future::pending().await;
    };
    match task.await {
        Ok(result) => result,
        Err(e) => {
            warn!("Stored credentials lookup did not complete: {}", e);
            Err(StoreError::Unavailable {
                config_id: config_id.to_string(),
            })
        }
    }
}
