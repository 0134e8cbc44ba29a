//! Session lifecycle states and the transitions between them.
//!
//! ```text
//!   open ──▶ Connecting ──ready──▶ Ready ◀──ready── Degraded
//!                │                   │ advisory error ▲ │
//!                │                   └────────────────┘ │
//!                └──── fatal error / close / timeout ───┴──▶ Closed
//! ```
//!
//! An advisory error while `Connecting` leaves the session `Connecting`.

use std::fmt;

use protocol::ErrorCode;

use crate::error::GatewayError;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// `connect` sent, waiting for `ready`.
    Connecting,
    /// Shell and file commands are accepted.
    Ready,
    /// Ready, but the backend reported an advisory error since.
    Degraded,
    /// Terminal state; the slot is released.
    Closed,
}

impl SessionState {
    /// Whether data, file and resize commands may be sent.
    pub fn accepts_commands(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Degraded)
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }

    /// State after a `ready` control message.
    pub fn on_ready(self) -> SessionState {
        match self {
            SessionState::Closed => SessionState::Closed,
            _ => SessionState::Ready,
        }
    }

    /// State after an `error` control message.
    pub fn on_error(self, fatal: bool) -> SessionState {
        match (self, fatal) {
            (_, true) | (SessionState::Closed, _) => SessionState::Closed,
            (SessionState::Connecting, false) => SessionState::Connecting,
            (SessionState::Ready | SessionState::Degraded, false) => SessionState::Degraded,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Why a session reached [`SessionState::Closed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The local caller closed it.
    ClientClosed,
    /// The backend sent `close`.
    ServerClosed(Option<String>),
    /// The backend sent a session-fatal `error`.
    Fatal { code: ErrorCode, message: String },
    /// `ready` never arrived.
    ConnectTimeout,
    /// The shared transport went away.
    TransportClosed(String),
    /// The gateway is shutting down.
    Shutdown,
}

impl CloseReason {
    /// The error reported to operations that find the session closed.
    pub fn to_error(&self, session_id: &str, server_id: &str) -> GatewayError {
        match self {
            CloseReason::Fatal { code, message } => GatewayError::SessionFailed {
                session_id: session_id.to_string(),
                server_id: server_id.to_string(),
                code: *code,
                message: message.clone(),
            },
            CloseReason::ConnectTimeout => GatewayError::ConnectTimeout {
                session_id: session_id.to_string(),
            },
            other => GatewayError::closed(session_id, other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("closed by client"),
            CloseReason::ServerClosed(Some(reason)) => write!(f, "closed by server: {reason}"),
            CloseReason::ServerClosed(None) => f.write_str("closed by server"),
            CloseReason::Fatal { code, message } => write!(f, "{code:?}: {message}"),
            CloseReason::ConnectTimeout => f.write_str("connect timed out"),
            CloseReason::TransportClosed(reason) => write!(f, "transport closed: {reason}"),
            CloseReason::Shutdown => f.write_str("gateway shutting down"),
        }
    }
}
