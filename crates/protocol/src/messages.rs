//! Protocol message definitions for termgate.
//!
//! Every message that crosses the transport is wrapped in an [`Envelope`]
//! carrying the session identifier it belongs to. The transport is shared by
//! many sessions; the `session_id` tag is the only thing that attributes a
//! message to its session. All envelopes are serialized using MessagePack.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for all protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Session this message is scoped to.
    pub session_id: String,
    /// Sequence number stamped by the sending side's writer queue.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(session_id: impl Into<String>, sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            session_id: session_id.into(),
            sequence,
            payload,
        }
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Top-level message enum containing all message types.
///
/// Tags follow the dotted vocabulary used by the browser client
/// (`connect`, `sftp.list`, `sftp.upload.chunk.ack`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Control messages
    /// Client asks the backend to open a shell for a server.
    #[serde(rename = "connect")]
    Connect(Connect),
    /// Backend reports the session is usable.
    #[serde(rename = "ready")]
    Ready(Ready),
    /// Backend reports a fatal or advisory error.
    #[serde(rename = "error")]
    Error(ErrorMessage),
    /// Session teardown, in either direction.
    #[serde(rename = "close")]
    Close(Close),
    /// Terminal geometry change.
    #[serde(rename = "resize")]
    Resize(Resize),

    // Data channel
    /// Raw terminal bytes (keystrokes upstream, output downstream).
    #[serde(rename = "data")]
    Data(Data),

    // File commands
    /// List a directory.
    #[serde(rename = "sftp.list")]
    FileList(FileList),
    /// Directory listing result.
    #[serde(rename = "sftp.list.data")]
    FileListData(FileListData),
    /// Fetch a text file for editing.
    #[serde(rename = "sftp.read")]
    FileRead(FileRead),
    /// Text file contents.
    #[serde(rename = "sftp.read.data")]
    FileReadData(FileReadData),
    /// Overwrite a file.
    #[serde(rename = "sftp.write")]
    FileWrite(FileWrite),
    /// Rename or move a path.
    #[serde(rename = "sftp.rename")]
    FileRename(FileRename),
    /// Delete a path.
    #[serde(rename = "sftp.delete")]
    FileDelete(FileDelete),
    /// Fetch a file as an opaque blob.
    #[serde(rename = "sftp.download")]
    FileDownload(FileDownload),
    /// Binary file contents.
    #[serde(rename = "sftp.download.data")]
    FileDownloadData(FileDownloadData),
    /// Acknowledgement of a write, rename or delete.
    #[serde(rename = "sftp.success")]
    FileSuccess(FileSuccess),
    /// Failure of a single file command.
    #[serde(rename = "sftp.error")]
    FileError(FileError),

    // Chunked upload
    /// Begin an upload.
    #[serde(rename = "sftp.upload.start")]
    UploadStart(UploadStart),
    /// Backend allocated a write handle.
    #[serde(rename = "sftp.upload.start.ack")]
    UploadStartAck(UploadStartAck),
    /// One chunk of upload data.
    #[serde(rename = "sftp.upload.chunk")]
    UploadChunk(UploadChunk),
    /// Backend persisted a chunk.
    #[serde(rename = "sftp.upload.chunk.ack")]
    UploadChunkAck(UploadChunkAck),
    /// No more chunks follow.
    #[serde(rename = "sftp.upload.finish")]
    UploadFinish(UploadFinish),
    /// Backend closed the handle; the file is complete.
    #[serde(rename = "sftp.upload.success")]
    UploadSuccess(UploadSuccess),
    /// Backend rejected the transfer.
    #[serde(rename = "sftp.upload.error")]
    UploadError(UploadError),
    /// Client abandons the transfer.
    #[serde(rename = "sftp.upload.abort")]
    UploadAbort(UploadAbort),

    // Monitoring
    /// Start pushing resource samples.
    #[serde(rename = "monitor.start")]
    MonitorStart(MonitorStart),
    /// Stop pushing resource samples.
    #[serde(rename = "monitor.stop")]
    MonitorStop(MonitorStop),
    /// A resource sample.
    #[serde(rename = "monitor.data")]
    MonitorData(MonitoringSample),
}

impl Message {
    /// Wire name of the message, as used in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect(_) => "connect",
            Message::Ready(_) => "ready",
            Message::Error(_) => "error",
            Message::Close(_) => "close",
            Message::Resize(_) => "resize",
            Message::Data(_) => "data",
            Message::FileList(_) => "sftp.list",
            Message::FileListData(_) => "sftp.list.data",
            Message::FileRead(_) => "sftp.read",
            Message::FileReadData(_) => "sftp.read.data",
            Message::FileWrite(_) => "sftp.write",
            Message::FileRename(_) => "sftp.rename",
            Message::FileDelete(_) => "sftp.delete",
            Message::FileDownload(_) => "sftp.download",
            Message::FileDownloadData(_) => "sftp.download.data",
            Message::FileSuccess(_) => "sftp.success",
            Message::FileError(_) => "sftp.error",
            Message::UploadStart(_) => "sftp.upload.start",
            Message::UploadStartAck(_) => "sftp.upload.start.ack",
            Message::UploadChunk(_) => "sftp.upload.chunk",
            Message::UploadChunkAck(_) => "sftp.upload.chunk.ack",
            Message::UploadFinish(_) => "sftp.upload.finish",
            Message::UploadSuccess(_) => "sftp.upload.success",
            Message::UploadError(_) => "sftp.upload.error",
            Message::UploadAbort(_) => "sftp.upload.abort",
            Message::MonitorStart(_) => "monitor.start",
            Message::MonitorStop(_) => "monitor.stop",
            Message::MonitorData(_) => "monitor.data",
        }
    }
}

// ============================================================================
// Control Messages
// ============================================================================

/// Request to open a shell on a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    /// Server/credential record the backend should connect to.
    pub server_id: String,
    /// Initial terminal columns.
    pub cols: u16,
    /// Initial terminal rows.
    pub rows: u16,
}

/// The session is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {}

/// Session teardown notice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    /// Human-readable reason, if any.
    pub reason: Option<String>,
}

/// Terminal resize notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Session-scoped error reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (e.g., host name, path).
    pub context: Option<String>,
    /// Whether the session survives this error.
    pub recoverable: bool,
}

impl ErrorMessage {
    /// Create an advisory error that leaves the session open.
    pub fn advisory(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            recoverable: true,
        }
    }

    /// Create an error that terminates the session.
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            recoverable: false,
        }
    }

    /// Whether this error terminates the session.
    ///
    /// An error is fatal when the backend marks it unrecoverable or when its
    /// code can only describe a dead session.
    pub fn is_fatal(&self) -> bool {
        !self.recoverable || self.code.is_session_fatal()
    }
}

/// Error codes for session-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Authentication against the remote host failed.
    AuthFailed,
    /// The remote host could not be reached.
    HostUnreachable,
    /// The backend has not attached a shell to this session yet.
    NotAttached,
    /// The backend lost its connection to the remote host.
    Disconnected,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Backend-side failure.
    InternalError,
    /// A backend operation timed out.
    Timeout,
}

impl ErrorCode {
    /// Codes that always end the session regardless of the recoverable flag.
    pub fn is_session_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed | ErrorCode::HostUnreachable | ErrorCode::Disconnected
        )
    }
}

// ============================================================================
// Data Channel
// ============================================================================

/// Raw terminal bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    /// The payload bytes.
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

// ============================================================================
// File Commands
// ============================================================================

/// Request to list a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    /// Correlation id, unique within the session.
    pub request_id: u64,
    /// Directory to list.
    pub path: String,
}

/// Directory listing result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListData {
    /// Correlation id of the request this answers.
    pub request_id: u64,
    /// Directory that was listed.
    pub path: String,
    /// Entries of the directory.
    pub entries: Vec<FileEntry>,
}

/// A single directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Size in bytes.
    pub size_bytes: u64,
    /// `ls -l` style permission string, e.g. `drwxr-xr-x`.
    pub permissions: String,
}

/// Request to read a text file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRead {
    pub request_id: u64,
    pub path: String,
}

/// File contents for editing.
///
/// Sent as raw bytes; the receiver decides whether they are text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReadData {
    pub request_id: u64,
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

/// Request to overwrite a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub request_id: u64,
    pub path: String,
    pub content: String,
}

/// Request to rename or move a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRename {
    pub request_id: u64,
    /// Existing path.
    pub from: String,
    /// New path; may be in another directory.
    pub to: String,
}

/// Request to delete a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDelete {
    pub request_id: u64,
    pub path: String,
}

/// Request to download a file as binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownload {
    pub request_id: u64,
    pub path: String,
}

/// Binary file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadData {
    pub request_id: u64,
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Successful write, rename or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSuccess {
    pub request_id: u64,
    /// Path the request named (the source path for renames).
    pub path: String,
}

/// Failure of a single file command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub request_id: u64,
    /// The offending path.
    pub path: String,
    pub code: FileErrorCode,
    pub message: String,
}

/// Error codes for file commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileErrorCode {
    /// Path does not exist (e.g. the directory changed under the caller).
    NotFound,
    /// Insufficient permissions on the remote host.
    PermissionDenied,
    /// The backend has no SFTP channel attached for this session yet.
    NotAttached,
    /// Target already exists.
    AlreadyExists,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Backend-side failure.
    Internal,
}

// ============================================================================
// Chunked Upload
// ============================================================================

/// Begin a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStart {
    /// Identifies this transfer; every reply for it echoes the id.
    pub transfer_id: u64,
    /// Destination path.
    pub path: String,
    /// Total file size in bytes.
    pub size: u64,
}

/// Backend allocated a write handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStartAck {
    pub transfer_id: u64,
    pub path: String,
}

/// One chunk of upload data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunk {
    pub transfer_id: u64,
    pub path: String,
    /// Byte offset within the destination; equals the sum of prior chunk lengths.
    pub offset: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Backend persisted the chunk at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunkAck {
    pub transfer_id: u64,
    pub path: String,
    pub offset: u64,
}

/// All chunks have been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFinish {
    pub transfer_id: u64,
    pub path: String,
    /// SHA-256 of the complete file.
    #[serde(with = "serde_bytes")]
    pub checksum: Vec<u8>,
}

/// The upload completed and the handle is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSuccess {
    pub transfer_id: u64,
    pub path: String,
}

/// The backend rejected the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadError {
    pub transfer_id: u64,
    pub path: String,
    pub code: FileErrorCode,
    pub message: String,
}

/// Client abandons a transfer; the backend discards the partial file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAbort {
    pub transfer_id: u64,
    pub path: String,
}

// ============================================================================
// Monitoring
// ============================================================================

/// Start the resource monitoring stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStart {}

/// Stop the resource monitoring stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStop {}

/// A resource usage sample for the remote host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSample {
    pub cpu_percent: f64,
    pub mem_used_kb: u64,
    pub mem_total_kb: u64,
    pub disk_percent: f64,
    pub net_up_bytes_per_sec: u64,
    pub net_down_bytes_per_sec: u64,
}
