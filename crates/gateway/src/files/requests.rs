//! Request/response correlation for file commands.
//!
//! Every request gets a `request_id` that is unique on the transport; the response must echo
//! the id and the requested path. A response is handed only to the request it
//! names, so two listings of different directories can never swap results.
//!
//! Requests are grouped into classes. Each class has a single slot: a second
//! request of the same class waits (FIFO) until the first resolves, and
//! requests of different classes run concurrently.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use protocol::messages::Message;
use tokio::sync::{oneshot, Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use super::CorrelationIds;
use crate::error::{FileOpError, GatewayError};

/// Concurrency class of a file command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    /// Directory listings.
    Listing,
    /// Read, write, rename and delete.
    Mutation,
    /// Binary downloads.
    Download,
}

/// A file command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOp {
    List,
    Read,
    Write,
    Rename,
    Delete,
    Download,
}

impl FileOp {
    pub fn class(self) -> RequestClass {
        match self {
            FileOp::List => RequestClass::Listing,
            FileOp::Read | FileOp::Write | FileOp::Rename | FileOp::Delete => {
                RequestClass::Mutation
            }
            FileOp::Download => RequestClass::Download,
        }
    }

    /// Whether `response` is a success answer for this kind of request.
    fn accepts(self, response: &Message) -> bool {
        matches!(
            (self, response),
            (FileOp::List, Message::FileListData(_))
                | (FileOp::Read, Message::FileReadData(_))
                | (FileOp::Download, Message::FileDownloadData(_))
                | (
                    FileOp::Write | FileOp::Rename | FileOp::Delete,
                    Message::FileSuccess(_)
                )
        )
    }
}

type Responder = oneshot::Sender<Result<Message, GatewayError>>;

struct Pending {
    op: FileOp,
    path: String,
    responder: Responder,
}

/// What happened to an inbound file response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting request.
    Delivered,
    /// No request with that id is pending (timed out or never sent).
    Unknown(u64),
    /// The message is not a file response.
    NotAResponse,
}

/// Outstanding file requests of one session.
pub(crate) struct PendingRequests {
    session_id: String,
    listing: Semaphore,
    mutation: Semaphore,
    download: Semaphore,
    ids: CorrelationIds,
    table: Mutex<HashMap<u64, Pending>>,
}

impl PendingRequests {
    pub(crate) fn new(session_id: impl Into<String>, ids: CorrelationIds) -> Self {
        Self {
            session_id: session_id.into(),
            listing: Semaphore::new(1),
            mutation: Semaphore::new(1),
            download: Semaphore::new(1),
            ids,
            table: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, class: RequestClass) -> &Semaphore {
        match class {
            RequestClass::Listing => &self.listing,
            RequestClass::Mutation => &self.mutation,
            RequestClass::Download => &self.download,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the class slot. `None` once the session has closed.
    pub(crate) async fn acquire(&self, class: RequestClass) -> Option<SemaphorePermit<'_>> {
        self.slot(class).acquire().await.ok()
    }

    /// Allocate a request id and start waiting for its response.
    ///
    /// Register before sending so a fast response cannot race the entry.
    pub(crate) fn register(
        &self,
        op: FileOp,
        path: &str,
    ) -> (u64, oneshot::Receiver<Result<Message, GatewayError>>) {
        let request_id = self.ids.next();
        let (responder, rx) = oneshot::channel();
        self.table().insert(
            request_id,
            Pending {
                op,
                path: path.to_string(),
                responder,
            },
        );
        (request_id, rx)
    }

    /// Drop a request that will never be answered (timed out or unsent).
    pub(crate) fn forget(&self, request_id: u64) {
        self.table().remove(&request_id);
    }

    /// Route a file response to the request it names.
    pub(crate) fn resolve(&self, response: Message) -> Resolution {
        let (request_id, path) = match &response {
            Message::FileListData(m) => (m.request_id, m.path.clone()),
            Message::FileReadData(m) => (m.request_id, m.path.clone()),
            Message::FileDownloadData(m) => (m.request_id, m.path.clone()),
            Message::FileSuccess(m) => (m.request_id, m.path.clone()),
            Message::FileError(m) => (m.request_id, m.path.clone()),
            _ => return Resolution::NotAResponse,
        };

        let Some(pending) = self.table().remove(&request_id) else {
            warn!(
                session_id = %self.session_id,
                request_id,
                kind = response.kind(),
                "discarding response for unknown request"
            );
            return Resolution::Unknown(request_id);
        };

        let result = if path != pending.path {
            Err(GatewayError::Protocol(format!(
                "response to request {request_id} names {path}, expected {}",
                pending.path
            )))
        } else {
            match response {
                Message::FileError(err) => Err(GatewayError::File(FileOpError {
                    kind: err.code.into(),
                    path: err.path,
                    message: err.message,
                })),
                other if pending.op.accepts(&other) => Ok(other),
                other => Err(GatewayError::Protocol(format!(
                    "request {request_id} ({:?}) answered with {}",
                    pending.op,
                    other.kind()
                ))),
            }
        };

        debug!(session_id = %self.session_id, request_id, ok = result.is_ok(), "resolved file request");
        // The requester may have given up already; that is fine.
        let _ = pending.responder.send(result);
        Resolution::Delivered
    }

    /// Fail every pending and queued request with `error`.
    ///
    /// Closes the class slots, so later `acquire` calls return `None`.
    pub(crate) fn reject_all(&self, error: &GatewayError) -> usize {
        self.listing.close();
        self.mutation.close();
        self.download.close();

        let drained: Vec<Pending> = self.table().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.responder.send(Err(error.clone()));
        }
        count
    }

    /// Number of requests waiting for a response.
    pub(crate) fn in_flight(&self) -> usize {
        self.table().len()
    }
}
