//! Error types surfaced by the gateway to its callers.
//!
//! Errors fall into three scopes:
//! - operation-scoped ([`FileOpError`], [`UploadError`]): only the request that
//!   produced them fails, the session stays usable
//! - session-scoped (`SessionFailed`, `SessionClosed`, `ConnectTimeout`): the
//!   session is gone and every pending request for it fails with the same error
//! - transport-scoped (`Transport`): the shared connection is gone

use std::fmt;

use protocol::{ErrorCode, FileErrorCode, ProtocolError};
use thiserror::Error;

use crate::files::upload::UploadState;
use crate::session::SessionState;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors returned by session, file and upload operations.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// A shell, file or resize command was attempted before the session was ready.
    #[error("session {session_id} is not ready (state: {state})")]
    NotReady {
        session_id: String,
        state: SessionState,
    },

    /// The session was closed while the operation was pending or queued.
    #[error("session {session_id} closed: {reason}")]
    SessionClosed { session_id: String, reason: String },

    /// No `ready` arrived within the connect timeout.
    #[error("session {session_id} timed out waiting for the backend")]
    ConnectTimeout { session_id: String },

    /// The backend reported a session-fatal error.
    #[error("session {session_id} (server {server_id}) failed: {code:?}: {message}")]
    SessionFailed {
        session_id: String,
        server_id: String,
        code: ErrorCode,
        message: String,
    },

    /// A single file command failed.
    #[error(transparent)]
    File(#[from] FileOpError),

    /// A chunked upload failed.
    #[error(transparent)]
    Upload(#[from] UploadError),

    /// A file command got no response in time.
    #[error("request {request_id} on session {session_id} timed out")]
    RequestTimeout { session_id: String, request_id: u64 },

    /// The backend answered in a way the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The shared transport failed or is closed.
    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),
}

impl GatewayError {
    /// Error for an operation on a session that went away.
    pub(crate) fn closed(session_id: &str, reason: impl Into<String>) -> Self {
        GatewayError::SessionClosed {
            session_id: session_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the owning session no longer exists.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            GatewayError::SessionClosed { .. }
            | GatewayError::ConnectTimeout { .. }
            | GatewayError::SessionFailed { .. }
            | GatewayError::Transport(_) => true,
            GatewayError::Upload(err) => matches!(err.failure, UploadFailure::SessionClosed { .. }),
            _ => false,
        }
    }
}

/// What went wrong with a file command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileErrorKind {
    /// The path does not exist (it may have changed under the caller).
    NotFound,
    /// The remote user may not access the path.
    PermissionDenied,
    /// The backend has no file channel for this session yet.
    NotAttached,
    /// The target path already exists.
    AlreadyExists,
    /// The backend rejected the request as malformed.
    InvalidRequest,
    /// The backend failed internally.
    Internal,
    /// A `read` returned bytes that are not valid UTF-8.
    NotText,
}

impl From<FileErrorCode> for FileErrorKind {
    fn from(code: FileErrorCode) -> Self {
        match code {
            FileErrorCode::NotFound => FileErrorKind::NotFound,
            FileErrorCode::PermissionDenied => FileErrorKind::PermissionDenied,
            FileErrorCode::NotAttached => FileErrorKind::NotAttached,
            FileErrorCode::AlreadyExists => FileErrorKind::AlreadyExists,
            FileErrorCode::InvalidRequest => FileErrorKind::InvalidRequest,
            FileErrorCode::Internal => FileErrorKind::Internal,
        }
    }
}

/// A structured file command failure naming the offending path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} on {path}: {message}")]
pub struct FileOpError {
    pub kind: FileErrorKind,
    pub path: String,
    pub message: String,
}

/// Why a chunked upload failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadFailure {
    /// Another upload to the same path is running in this session.
    #[error("another upload to this path is in progress")]
    AlreadyInProgress,

    /// The backend reported an error during the transfer.
    #[error("backend rejected the transfer ({code}): {message}")]
    Rejected { code: String, message: String },

    /// No acknowledgement arrived in time.
    #[error("no acknowledgement for offset {offset}")]
    AckTimeout { offset: u64 },

    /// The backend acknowledged a different offset than the one just sent.
    #[error("acknowledgement for offset {got}, expected {expected}")]
    UnexpectedAck { expected: u64, got: u64 },

    /// The session closed mid-transfer.
    #[error("session closed: {reason}")]
    SessionClosed { reason: String },

    /// Reading the local source failed.
    #[error("reading source failed: {0}")]
    Source(String),

    /// The source ended before delivering the declared size.
    #[error("source delivered {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// A failed upload, carrying how far it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadError {
    pub path: String,
    pub failure: UploadFailure,
    pub bytes_acknowledged: u64,
    pub total_bytes: u64,
    /// Always [`UploadState::Aborted`] once the error is returned.
    pub state: UploadState,
}

impl UploadError {
    /// Whole percent of the file acknowledged before the failure.
    pub fn percent(&self) -> u64 {
        if self.total_bytes == 0 {
            return 0;
        }
        self.bytes_acknowledged.saturating_mul(100) / self.total_bytes
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "upload of {} failed at {}%: {}",
            self.path,
            self.percent(),
            self.failure
        )
    }
}

impl std::error::Error for UploadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.failure)
    }
}
