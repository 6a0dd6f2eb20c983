// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 OpenVPN Manager Contributors

//! Connection state machine for one session
//!
//! `SessionMachine` is synchronous and does no I/O. The session task feeds it
//! output lines, credentials, timer expiry and process exit, and carries out
//! the returned `Action`s in order. Tests drive it directly.

use std::collections::VecDeque;

use openvpn_manager_common::{ConnectionState, Credentials, ErrorKind, OutputStream};
use tracing::{debug, info, warn};

use crate::classifier::{MarkerKind, MarkerTable};
use crate::credentials::StoreError;
use crate::supervisor::ExitStatus;

/// Replacement for scrubbed secrets in forwarded lines
pub const SCRUBBED: &str = "********";

/// Usernames shorter than this are left in place when scrubbing
const MIN_SCRUB_USERNAME_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Username,
    Password,
}

/// Side effect requested by the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transition(ConnectionState),
    /// Forward a (scrubbed) line to the log sinks
    Log { stream: OutputStream, line: String },
    AuthenticationRequired,
    /// Look up stored credentials and report back with `on_stored_credentials`
    LookupStoredCredentials,
    /// Ask the caller for credentials and start the authentication timer
    RequestCredentials,
    /// Write the answer to a prompt, see `SessionMachine::answer`
    Answer(PromptKind),
    Established {
        interface: Option<String>,
        address: Option<String>,
    },
    PersistCredentials(Credentials),
    /// Stop the process; the session already failed
    Terminate,
    Error { kind: ErrorKind, message: String },
}

/// Why `on_credentials` was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotAwaiting(pub ConnectionState);

pub struct SessionMachine {
    config_id: String,
    markers: MarkerTable,
    state: ConnectionState,

    credentials: Option<Credentials>,
    save_credentials: bool,
    /// Prompt seen but not answered yet
    pending_prompt: Option<PromptKind>,
    lookup_done: bool,
    /// Store lookup issued and not answered yet
    lookup_pending: bool,
    credentials_requested: bool,
    /// Both prompts answered at least once
    answered: bool,

    stop_requested: bool,
    interface: Option<String>,
    address: Option<String>,
    fatal_line: Option<String>,

    stderr_tail: VecDeque<String>,
    stderr_tail_lines: usize,
}

impl SessionMachine {
    pub fn new(
        config_id: impl Into<String>,
        markers: MarkerTable,
        stderr_tail_lines: usize,
        credentials: Option<Credentials>,
        save_credentials: bool,
    ) -> Self {
        let config_id = config_id.into();
        let credentials = credentials.map(|c| c.for_config(&config_id));
        Self {
            config_id,
            markers,
            state: ConnectionState::Idle,
            credentials,
            save_credentials,
            pending_prompt: None,
            lookup_done: false,
            lookup_pending: false,
            credentials_requested: false,
            answered: false,
            stop_requested: false,
            interface: None,
            address: None,
            fatal_line: None,
            stderr_tail: VecDeque::new(),
            stderr_tail_lines,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Text to write for an `Action::Answer`
    pub fn answer(&self, prompt: PromptKind) -> Option<&str> {
        self.credentials.as_ref().map(|c| match prompt {
            PromptKind::Username => c.username(),
            PromptKind::Password => c.password(),
        })
    }

    /// Most recent stderr lines, oldest first
    pub fn stderr_tail(&self) -> impl Iterator<Item = &str> {
        self.stderr_tail.iter().map(String::as_str)
    }

    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.transition(ConnectionState::Connecting, &mut actions);
        actions
    }

    /// Fail the session from outside the output stream (spawn errors)
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Vec<Action> {
        let mut actions = Vec::new();
        self.fail_into(kind, message.into(), &mut actions);
        actions
    }

    pub fn on_line(&mut self, stream: OutputStream, text: &str) -> Vec<Action> {
        let line = self.scrub(text);
        if self.state.is_terminal() {
            // Late output still reaches the sinks
            return vec![Action::Log { stream, line }];
        }

        let mut actions = Vec::new();
        if stream == OutputStream::Stderr && self.stderr_tail_lines > 0 {
            if self.stderr_tail.len() == self.stderr_tail_lines {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(line.clone());
        }

        let classification = self.markers.classify(text);
        if let Some(kind) = classification.kind {
            debug!("Classified output as {:?}: {}", kind, line);
        }
        actions.push(Action::Log { stream, line: line.clone() });

        match classification.kind {
            Some(MarkerKind::UsernamePrompt) => self.on_prompt(PromptKind::Username, &mut actions),
            Some(MarkerKind::PasswordPrompt) => self.on_prompt(PromptKind::Password, &mut actions),
            Some(MarkerKind::AuthFailed) => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Authenticating
                ) {
                    // Rejected credentials are never persisted
                    self.credentials = None;
                    self.fail_into(
                        ErrorKind::AuthenticationFailed,
                        "Authentication failed: the server rejected the credentials".to_string(),
                        &mut actions,
                    );
                    actions.push(Action::Terminate);
                }
            }
            Some(MarkerKind::InterfaceOpened) | Some(MarkerKind::AddressAssigned) => {
                if classification.interface.is_some() {
                    self.interface = classification.interface;
                }
                if classification.address.is_some() {
                    self.address = classification.address;
                }
            }
            Some(MarkerKind::TunnelEstablished) => {
                if classification.interface.is_some() {
                    self.interface = classification.interface;
                }
                if classification.address.is_some() {
                    self.address = classification.address;
                }
                self.on_established(&mut actions);
            }
            Some(MarkerKind::ProcessExiting) => {
                if !self.stop_requested && self.state != ConnectionState::Disconnecting {
                    self.credentials = None;
                    self.transition(ConnectionState::Disconnecting, &mut actions);
                }
            }
            Some(MarkerKind::FatalError) => {
                self.fatal_line = Some(line);
            }
            None => {}
        }
        actions
    }

    fn on_prompt(&mut self, prompt: PromptKind, actions: &mut Vec<Action>) {
        match self.state {
            ConnectionState::Connecting => {
                self.transition(ConnectionState::Authenticating, actions);
                actions.push(Action::AuthenticationRequired);
            }
            ConnectionState::Authenticating => {}
            _ => {
                debug!("Ignoring {:?} prompt in state {}", prompt, self.state);
                return;
            }
        }

        // A username prompt after a full answer means the client is asking again
        if prompt == PromptKind::Username && self.answered {
            warn!("VPN client asked for credentials again for '{}'", self.config_id);
            self.credentials = None;
            self.answered = false;
            self.credentials_requested = false;
            self.lookup_done = true;
        }

        if self.credentials.is_some() {
            self.answer_prompt(prompt, actions);
            return;
        }

        self.pending_prompt = Some(prompt);
        if self.lookup_pending {
            return;
        }
        if !self.lookup_done {
            self.lookup_done = true;
            self.lookup_pending = true;
            actions.push(Action::LookupStoredCredentials);
        } else {
            self.request_credentials(actions);
        }
    }

    fn answer_prompt(&mut self, prompt: PromptKind, actions: &mut Vec<Action>) {
        self.pending_prompt = None;
        if prompt == PromptKind::Password {
            self.answered = true;
        }
        actions.push(Action::Answer(prompt));
    }

    fn request_credentials(&mut self, actions: &mut Vec<Action>) {
        if !self.credentials_requested {
            self.credentials_requested = true;
            actions.push(Action::RequestCredentials);
        }
    }

    fn on_established(&mut self, actions: &mut Vec<Action>) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Authenticating
        ) {
            return;
        }
        self.pending_prompt = None;
        self.transition(ConnectionState::Connected, actions);
        actions.push(Action::Established {
            interface: self.interface.clone(),
            address: self.address.clone(),
        });

        // Credentials live only for the connect attempt
        if let Some(credentials) = self.credentials.take() {
            if self.save_credentials {
                actions.push(Action::PersistCredentials(credentials));
            }
        }
    }

    /// Result of `Action::LookupStoredCredentials`
    pub fn on_stored_credentials(
        &mut self,
        result: Result<Option<Credentials>, StoreError>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        self.lookup_pending = false;
        if self.state != ConnectionState::Authenticating {
            return actions;
        }

        match result {
            Ok(Some(credentials)) if self.credentials.is_none() => {
                info!("Using stored credentials for '{}'", self.config_id);
                self.credentials = Some(credentials.for_config(&self.config_id));
                // Already stored, nothing to save afterwards
                self.save_credentials = false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Stored credentials lookup failed: {}", e);
                actions.push(Action::Error {
                    kind: ErrorKind::StoreUnavailable,
                    message: e.to_string(),
                });
            }
        }

        match (self.pending_prompt, self.credentials.is_some()) {
            (Some(prompt), true) => self.answer_prompt(prompt, &mut actions),
            (Some(_), false) => self.request_credentials(&mut actions),
            (None, _) => {}
        }
        actions
    }

    /// Credentials supplied by the caller after `RequestCredentials`, or ahead of a prompt
    pub fn on_credentials(
        &mut self,
        credentials: Credentials,
        save: bool,
    ) -> Result<Vec<Action>, NotAwaiting> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Authenticating
        ) || self.stop_requested
        {
            return Err(NotAwaiting(self.state));
        }

        self.credentials = Some(credentials.for_config(&self.config_id));
        self.save_credentials = save;

        let mut actions = Vec::new();
        if let Some(prompt) = self.pending_prompt {
            self.answer_prompt(prompt, &mut actions);
        }
        Ok(actions)
    }

    pub fn on_auth_timeout(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state == ConnectionState::Authenticating && self.pending_prompt.is_some() {
            self.fail_into(
                ErrorKind::AuthenticationTimeout,
                "Timed out waiting for credentials".to_string(),
                &mut actions,
            );
            actions.push(Action::Terminate);
        }
        actions
    }

    pub fn on_write_failed(&mut self) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        vec![Action::Error {
            kind: ErrorKind::ClosedPipe,
            message: "VPN client closed its input before the prompt was answered".to_string(),
        }]
    }

    /// `disconnect()` was called
    pub fn on_stop_requested(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        self.stop_requested = true;
        self.pending_prompt = None;
        self.credentials = None;
        if self.state != ConnectionState::Disconnecting {
            self.transition(ConnectionState::Disconnecting, &mut actions);
        }
        actions
    }

    pub fn on_exit(&mut self, status: ExitStatus) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            return actions;
        }
        self.credentials = None;

        let clean = self.stop_requested
            || (self.state == ConnectionState::Disconnecting && status.success());
        if clean {
            if self.state != ConnectionState::Disconnecting {
                self.transition(ConnectionState::Disconnecting, &mut actions);
            }
            self.transition(ConnectionState::Disconnected, &mut actions);
            return actions;
        }

        let mut message = format!("VPN client exited unexpectedly ({})", status);
        if let Some(fatal) = &self.fatal_line {
            message.push_str(": ");
            message.push_str(fatal);
        }
        if !self.stderr_tail.is_empty() {
            message.push('\n');
            message.push_str(&self.stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n"));
        }
        self.fail_into(ErrorKind::UnexpectedExit, message, &mut actions);
        actions
    }

    fn fail_into(&mut self, kind: ErrorKind, message: String, actions: &mut Vec<Action>) {
        if self.transition(ConnectionState::Failed(kind), actions) {
            actions.push(Action::Error { kind, message });
        }
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Vec<Action>) -> bool {
        if !self.state.can_transition_to(next) {
            warn!("Ignoring transition {} -> {}", self.state, next);
            return false;
        }
        info!("Session '{}': {} -> {}", self.config_id, self.state, next);
        self.state = next;
        actions.push(Action::Transition(next));
        true
    }

    /// Hide the credentials of this attempt if the client echoes them
    fn scrub(&self, text: &str) -> String {
        let Some(credentials) = &self.credentials else {
            return text.to_string();
        };
        let mut line = text.to_string();
        if !credentials.password().is_empty() {
            line = line.replace(credentials.password(), SCRUBBED);
        }
        if credentials.username().chars().count() >= MIN_SCRUB_USERNAME_LEN {
            line = line.replace(credentials.username(), SCRUBBED);
        }
        line
    }
}
