// Common types for OpenVPN Manager

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Kind of failure, shared by events, failed states and controller errors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    SpawnError,
    ClosedPipe,
    CredentialsRequired,
    AuthenticationFailed,
    AuthenticationTimeout,
    UnexpectedExit,
    StoreUnavailable,
    AlreadyConnected,
    StopTimeout,
    NoActiveSession,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::SpawnError => "spawn error",
            ErrorKind::ClosedPipe => "closed pipe",
            ErrorKind::CredentialsRequired => "credentials required",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::AuthenticationTimeout => "authentication timeout",
            ErrorKind::UnexpectedExit => "unexpected exit",
            ErrorKind::StoreUnavailable => "secret store unavailable",
            ErrorKind::AlreadyConnected => "already connected",
            ErrorKind::StopTimeout => "stop timeout",
            ErrorKind::NoActiveSession => "no active session",
            ErrorKind::Config => "configuration error",
        };
        f.write_str(name)
    }
}

/// State of the connection session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,           // session exists, helper not started yet
    Connecting,     // helper running, no tunnel yet
    Authenticating, // VPN client asked for username/password
    Connected,      // "Initialization Sequence Completed"
    Disconnecting,  // stop requested or client announced exit
    Disconnected,   // terminal, clean
    Failed(ErrorKind), // terminal, with reason
}

impl ConnectionState {
    /// Terminal states need a fresh connect() to leave
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if the state represents a transitional state
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Disconnecting
        )
    }

    /// Whether the session state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed(_)) {
            return true;
        }

        matches!(
            (*self, next),
            (Idle, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Authenticating, Connected)
                | (Authenticating, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Authenticating => f.write_str("authenticating"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// Which pipe of the VPN client a line came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Error recorded on a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Point-in-time view of the active session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub config_id: String,
    pub config_name: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SessionError>,
    pub started_at: DateTime<Utc>,
}

/// Events emitted by the connection controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// Session moved to a new state
    StateChanged {
        session_id: Uuid,
        state: ConnectionState,
        timestamp: DateTime<Utc>,
    },

    /// VPN client prompted for username/password
    AuthenticationRequired {
        session_id: Uuid,
        config_id: String,
        timestamp: DateTime<Utc>,
    },

    /// No credentials supplied or stored, caller must provide them
    CredentialsRequired {
        session_id: Uuid,
        config_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Tunnel is up
    Connected {
        session_id: Uuid,
        interface: Option<String>,
        address: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Session ended cleanly
    Disconnected {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    Error {
        session_id: Option<Uuid>,
        kind: ErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ControllerEvent {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            ControllerEvent::StateChanged { session_id, .. }
            | ControllerEvent::AuthenticationRequired { session_id, .. }
            | ControllerEvent::CredentialsRequired { session_id, .. }
            | ControllerEvent::Connected { session_id, .. }
            | ControllerEvent::Disconnected { session_id, .. } => Some(*session_id),
            ControllerEvent::Error { session_id, .. } => *session_id,
        }
    }
}

/// One line of VPN client output, scrubbed
///
/// Delivered on its own channel so a chatty client cannot push state
/// events out of a slow subscriber's queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogLine {
    pub session_id: Uuid,
    pub stream: OutputStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of the passwordless-privilege probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionReport {
    pub ok: bool,
    pub helper_path: String,
    pub remediation_text: String,
}

/// Username/password for one configuration
///
/// Buffers are wiped on drop. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    config_id: String,
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(
        config_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            config_id: config_id.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Same secrets, attached to another configuration
    pub fn for_config(&self, config_id: &str) -> Self {
        Self::new(config_id, self.username.as_str(), self.password.as_str())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("config_id", &self.config_id)
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_reject_transitions() {
        let failed = ConnectionState::Failed(ErrorKind::UnexpectedExit);
        assert!(!failed.can_transition_to(ConnectionState::Connecting));
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Connecting));
        assert!(!ConnectionState::Disconnected
            .can_transition_to(ConnectionState::Failed(ErrorKind::UnexpectedExit)));
    }

    #[test]
    fn test_lifecycle_transitions() {
        use ConnectionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(Authenticating.can_transition_to(Failed(ErrorKind::AuthenticationFailed)));

        assert!(!Idle.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Authenticating));
        assert!(!Connected.can_transition_to(Disconnected));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("work", "alice", "hunter22");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter22"));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ConnectionState::Failed(ErrorKind::AuthenticationTimeout))
            .unwrap();
        assert_eq!(json, r#"{"failed":"authentication_timeout"}"#);
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            r#""connected""#
        );
    }
}
