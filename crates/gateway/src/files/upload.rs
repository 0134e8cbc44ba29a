//! Lock-step chunked upload.
//!
//! ```text
//!   upload.start ──▶ start.ack
//!   chunk@0      ──▶ chunk.ack@0
//!   chunk@n      ──▶ chunk.ack@n     (exactly one chunk in flight)
//!   finish       ──▶ upload.success
//! ```
//!
//! Any error, timeout or out-of-step acknowledgement aborts the transfer;
//! `finish` is only ever sent after every chunk was acknowledged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use protocol::messages::{Message, UploadAbort, UploadChunk, UploadFinish, UploadStart};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Refresh;
use crate::error::{UploadError, UploadFailure};
use crate::events::GatewayEvent;
use crate::session::inner::SessionInner;

/// Buffered acknowledgements per upload. Lock-step means at most one is
/// expected at a time; the slack absorbs a misbehaving backend.
const SIGNAL_CAPACITY: usize = 4;

/// Progress of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    Started,
    Transferring,
    Finishing,
    Complete,
    Aborted,
}

/// Byte accounting for one transfer, independent of any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    path: String,
    total_bytes: u64,
    chunk_size: usize,
    bytes_acknowledged: u64,
    in_flight: Option<(u64, u64)>,
    state: UploadState,
}

impl Transfer {
    pub fn new(path: impl Into<String>, total_bytes: u64, chunk_size: usize) -> Self {
        Self {
            path: path.into(),
            total_bytes,
            chunk_size: chunk_size.max(1),
            bytes_acknowledged: 0,
            in_flight: None,
            state: UploadState::Started,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn bytes_acknowledged(&self) -> u64 {
        self.bytes_acknowledged
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of chunks the whole file takes.
    pub fn chunk_count(&self) -> u64 {
        self.total_bytes.div_ceil(self.chunk_size as u64)
    }

    pub fn start_acknowledged(&mut self) {
        if self.state == UploadState::Started {
            self.state = UploadState::Transferring;
        }
    }

    /// Length of the next chunk, or `None` when every byte is acknowledged
    /// or a chunk is still awaiting its acknowledgement.
    pub fn next_chunk_len(&self) -> Option<usize> {
        if self.state != UploadState::Transferring || self.in_flight.is_some() {
            return None;
        }
        let remaining = self.total_bytes - self.bytes_acknowledged;
        if remaining == 0 {
            return None;
        }
        Some(remaining.min(self.chunk_size as u64) as usize)
    }

    /// Record that a chunk of `len` bytes was sent; returns its offset.
    pub fn chunk_sent(&mut self, len: usize) -> u64 {
        let offset = self.bytes_acknowledged;
        self.in_flight = Some((offset, len as u64));
        offset
    }

    /// Apply an acknowledgement. Only the in-flight offset is accepted.
    pub fn chunk_acknowledged(&mut self, offset: u64) -> Result<(), UploadFailure> {
        match self.in_flight {
            Some((expected, len)) if expected == offset => {
                self.bytes_acknowledged += len;
                self.in_flight = None;
                Ok(())
            }
            Some((expected, _)) => Err(UploadFailure::UnexpectedAck {
                expected,
                got: offset,
            }),
            None => Err(UploadFailure::UnexpectedAck {
                expected: self.bytes_acknowledged,
                got: offset,
            }),
        }
    }

    /// Move to `Finishing`. Refused until every byte is acknowledged.
    pub fn begin_finish(&mut self) -> bool {
        let done = self.bytes_acknowledged == self.total_bytes && self.in_flight.is_none();
        if done && self.state == UploadState::Transferring {
            self.state = UploadState::Finishing;
            return true;
        }
        false
    }

    pub fn complete(&mut self) {
        if self.state == UploadState::Finishing {
            self.state = UploadState::Complete;
        }
    }

    /// Abort and describe how far the transfer got.
    pub fn fail(&mut self, failure: UploadFailure) -> UploadError {
        self.state = UploadState::Aborted;
        self.in_flight = None;
        UploadError {
            path: self.path.clone(),
            failure,
            bytes_acknowledged: self.bytes_acknowledged,
            total_bytes: self.total_bytes,
            state: self.state,
        }
    }
}

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub path: String,
    pub bytes: u64,
    pub chunks: u64,
    /// SHA-256 of the uploaded content, as sent with `finish`.
    pub checksum: Vec<u8>,
    pub refresh: Refresh,
}

/// Backend replies routed to a running upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UploadSignal {
    StartAck,
    ChunkAck { offset: u64 },
    Complete,
    Failed { code: String, message: String },
}

/// A running upload as seen by the dispatcher.
struct Running {
    transfer_id: u64,
    signals: mpsc::Sender<UploadSignal>,
    stop: CancellationToken,
    released: CancellationToken,
}

/// Uploads in flight for one session, keyed by destination path.
///
/// Replies are routed by path and must echo the transfer id of the running
/// upload; anything else belongs to a transfer that no longer exists.
#[derive(Default)]
pub(crate) struct UploadSlots {
    active: Mutex<HashMap<String, Running>>,
    stopping: AtomicBool,
}

/// Holds a path in [`UploadSlots`] until dropped.
pub(crate) struct UploadClaim<'a> {
    slots: &'a UploadSlots,
    path: String,
    transfer_id: u64,
    stop: CancellationToken,
    released: CancellationToken,
}

impl UploadClaim<'_> {
    pub(crate) fn transfer_id(&self) -> u64 {
        self.transfer_id
    }

    /// Cancelled when the session wants the upload to stop sending.
    pub(crate) fn stop(&self) -> &CancellationToken {
        &self.stop
    }
}

impl Drop for UploadClaim<'_> {
    fn drop(&mut self) {
        self.slots.active().remove(&self.path);
        self.released.cancel();
    }
}

impl UploadSlots {
    fn active(&self) -> MutexGuard<'_, HashMap<String, Running>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `path` for transfer `transfer_id`.
    pub(crate) fn claim(
        &self,
        path: &str,
        transfer_id: u64,
    ) -> Result<(UploadClaim<'_>, mpsc::Receiver<UploadSignal>), UploadFailure> {
        let mut active = self.active();
        if self.stopping.load(Ordering::SeqCst) {
            return Err(UploadFailure::SessionClosed {
                reason: "session closing".to_string(),
            });
        }
        if active.contains_key(path) {
            return Err(UploadFailure::AlreadyInProgress);
        }
        let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
        let stop = CancellationToken::new();
        let released = CancellationToken::new();
        active.insert(
            path.to_string(),
            Running {
                transfer_id,
                signals: tx,
                stop: stop.clone(),
                released: released.clone(),
            },
        );
        Ok((
            UploadClaim {
                slots: self,
                path: path.to_string(),
                transfer_id,
                stop,
                released,
            },
            rx,
        ))
    }

    /// Deliver a backend reply to the upload for `path`.
    ///
    /// Returns false when no upload with that id runs on `path`.
    pub(crate) fn route(&self, path: &str, transfer_id: u64, signal: UploadSignal) -> bool {
        let tx = match self.active().get(path) {
            Some(running) if running.transfer_id == transfer_id => running.signals.clone(),
            _ => return false,
        };
        match tx.try_send(signal) {
            Ok(()) => true,
            Err(e) => {
                warn!(path, transfer_id, "dropping upload reply: {}", e);
                false
            }
        }
    }

    /// Fail every running upload with a backend error.
    pub(crate) fn fail_all(&self, code: &str, message: &str) {
        let senders: Vec<_> = self
            .active()
            .values()
            .map(|running| running.signals.clone())
            .collect();
        for tx in senders {
            let _ = tx.try_send(UploadSignal::Failed {
                code: code.to_string(),
                message: message.to_string(),
            });
        }
    }

    /// Stop every running upload and refuse new ones.
    ///
    /// Returns tokens that are cancelled as each upload releases its path;
    /// once they all are, no upload message for this session follows.
    pub(crate) fn stop_all(&self) -> Vec<CancellationToken> {
        let active = self.active();
        self.stopping.store(true, Ordering::SeqCst);
        active
            .values()
            .map(|running| {
                running.stop.cancel();
                running.released.clone()
            })
            .collect()
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        self.active().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.active().len()
    }
}

/// Upload `size` bytes from `source` to `path` over `session`.
pub(crate) async fn run<R>(
    session: &SessionInner,
    path: &str,
    mut source: R,
    size: u64,
) -> Result<UploadOutcome, UploadError>
where
    R: AsyncRead + Unpin,
{
    let mut transfer = Transfer::new(path, size, session.ctx.options.chunk_size);
    let (claim, mut signals) = match session.uploads.claim(path, session.ctx.ids.next()) {
        Ok(claimed) => claimed,
        Err(failure) => return Err(transfer.fail(failure)),
    };
    let transfer_id = claim.transfer_id();

    info!(
        session_id = %session.id,
        path,
        transfer_id,
        size,
        chunks = transfer.chunk_count(),
        "starting upload"
    );

    match drive(session, &claim, &mut transfer, &mut signals, &mut source).await {
        Ok(checksum) => {
            transfer.complete();
            let refresh = Refresh::parents_of(&[path]);
            session.ctx.events.emit(GatewayEvent::UploadFinished {
                session_id: session.id.clone(),
                path: path.to_string(),
                refresh: refresh.clone(),
            });
            info!(
                session_id = %session.id,
                path,
                size,
                sha256 = %hex::encode(&checksum),
                "upload complete"
            );
            Ok(UploadOutcome {
                path: path.to_string(),
                bytes: size,
                chunks: transfer.chunk_count(),
                checksum,
                refresh,
            })
        }
        Err(failure) => {
            // A closed session has nothing left to abort.
            if !session.closed.is_cancelled() {
                let abort = Message::UploadAbort(UploadAbort {
                    transfer_id,
                    path: path.to_string(),
                });
                if let Err(e) = session.send(abort).await {
                    debug!(session_id = %session.id, path, "could not send abort: {}", e);
                }
            }
            let err = transfer.fail(failure);
            warn!(session_id = %session.id, transfer_id, "{}", err);
            session.ctx.events.emit(GatewayEvent::UploadFailed {
                session_id: session.id.clone(),
                path: path.to_string(),
                message: err.to_string(),
            });
            Err(err)
        }
    }
}

async fn drive<R>(
    session: &SessionInner,
    claim: &UploadClaim<'_>,
    transfer: &mut Transfer,
    signals: &mut mpsc::Receiver<UploadSignal>,
    source: &mut R,
) -> Result<Vec<u8>, UploadFailure>
where
    R: AsyncRead + Unpin,
{
    let path = transfer.path().to_string();
    let total = transfer.total_bytes();
    let transfer_id = claim.transfer_id();

    send(session, claim, Message::UploadStart(UploadStart {
        transfer_id,
        path: path.clone(),
        size: total,
    }))
    .await?;
    match next_signal(session, claim, signals, 0).await? {
        UploadSignal::StartAck => transfer.start_acknowledged(),
        other => return Err(out_of_step(other, 0)),
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; session.ctx.options.chunk_size.max(1)];
    while let Some(len) = transfer.next_chunk_len() {
        let chunk = &mut buf[..len];
        let read = tokio::select! {
            biased;
            failure = halted(session, claim) => return Err(failure),
            read = fill(source, chunk) => read?,
        };
        if read < len {
            return Err(UploadFailure::SizeMismatch {
                expected: total,
                actual: transfer.bytes_acknowledged() + read as u64,
            });
        }
        hasher.update(&*chunk);

        let offset = transfer.chunk_sent(len);
        send(session, claim, Message::UploadChunk(UploadChunk {
            transfer_id,
            path: path.clone(),
            offset,
            data: chunk.to_vec(),
        }))
        .await?;

        match next_signal(session, claim, signals, offset).await? {
            UploadSignal::ChunkAck { offset: acked } => transfer.chunk_acknowledged(acked)?,
            other => return Err(out_of_step(other, offset)),
        }
        debug!(session_id = %session.id, path = %path, offset, len, "chunk acknowledged");
        session.ctx.events.emit(GatewayEvent::UploadProgress {
            session_id: session.id.clone(),
            path: path.clone(),
            bytes_acknowledged: transfer.bytes_acknowledged(),
            total_bytes: total,
        });
    }

    if !transfer.begin_finish() {
        return Err(UploadFailure::SizeMismatch {
            expected: total,
            actual: transfer.bytes_acknowledged(),
        });
    }

    let checksum = hasher.finalize().to_vec();
    send(session, claim, Message::UploadFinish(UploadFinish {
        transfer_id,
        path: path.clone(),
        checksum: checksum.clone(),
    }))
    .await?;
    match next_signal(session, claim, signals, total).await? {
        UploadSignal::Complete => Ok(checksum),
        other => Err(out_of_step(other, total)),
    }
}

/// Why the upload may not continue, if it may not.
fn interrupted(session: &SessionInner, claim: &UploadClaim<'_>) -> Option<UploadFailure> {
    if session.closed.is_cancelled() {
        Some(UploadFailure::SessionClosed {
            reason: session.close_reason_text(),
        })
    } else if claim.stop().is_cancelled() {
        Some(UploadFailure::SessionClosed {
            reason: "session closing".to_string(),
        })
    } else {
        None
    }
}

/// Resolves once the session closes or asks the upload to stop.
async fn halted(session: &SessionInner, claim: &UploadClaim<'_>) -> UploadFailure {
    tokio::select! {
        _ = session.closed.cancelled() => {}
        _ = claim.stop().cancelled() => {}
    }
    interrupted(session, claim).unwrap_or(UploadFailure::SessionClosed {
        reason: "session closing".to_string(),
    })
}

async fn send(
    session: &SessionInner,
    claim: &UploadClaim<'_>,
    message: Message,
) -> Result<(), UploadFailure> {
    if let Some(failure) = interrupted(session, claim) {
        return Err(failure);
    }
    session
        .send(message)
        .await
        .map_err(|e| UploadFailure::SessionClosed {
            reason: e.to_string(),
        })
}

/// Wait for the next backend reply, bounded by the ack timeout.
async fn next_signal(
    session: &SessionInner,
    claim: &UploadClaim<'_>,
    signals: &mut mpsc::Receiver<UploadSignal>,
    offset: u64,
) -> Result<UploadSignal, UploadFailure> {
    let ack_timeout = session.ctx.options.ack_timeout;
    tokio::select! {
        biased;
        failure = halted(session, claim) => Err(failure),
        received = tokio::time::timeout(ack_timeout, signals.recv()) => match received {
            Err(_) => Err(UploadFailure::AckTimeout { offset }),
            Ok(None) => Err(UploadFailure::SessionClosed {
                reason: "upload channel closed".to_string(),
            }),
            Ok(Some(UploadSignal::Failed { code, message })) => {
                Err(UploadFailure::Rejected { code, message })
            }
            Ok(Some(signal)) => Ok(signal),
        },
    }
}

fn out_of_step(signal: UploadSignal, expected: u64) -> UploadFailure {
    match signal {
        UploadSignal::ChunkAck { offset } => UploadFailure::UnexpectedAck {
            expected,
            got: offset,
        },
        UploadSignal::StartAck => UploadFailure::Rejected {
            code: "protocol".to_string(),
            message: "unexpected start acknowledgement".to_string(),
        },
        UploadSignal::Complete => UploadFailure::Rejected {
            code: "protocol".to_string(),
            message: "completion before finish".to_string(),
        },
        UploadSignal::Failed { code, message } => UploadFailure::Rejected { code, message },
    }
}

/// Read until `buf` is full or the source ends; returns bytes read.
async fn fill<R>(source: &mut R, buf: &mut [u8]) -> Result<usize, UploadFailure>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source
            .read(&mut buf[filled..])
            .await
            .map_err(|e| UploadFailure::Source(e.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
