//! Shared per-session state and lifecycle transitions.
//!
//! [`SessionInner`] is owned jointly by the registry, the dispatcher and every
//! [`Session`](super::Session) handle. Inbound messages are applied here, one
//! at a time, by the dispatcher task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use protocol::messages::{Message, MonitoringSample};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::SessionRegistry;
use super::state::{CloseReason, Geometry, SessionState};
use crate::config::GatewayOptions;
use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};
use crate::files::requests::PendingRequests;
use crate::files::CorrelationIds;
use crate::files::upload::{UploadSignal, UploadSlots};
use crate::monitor::MonitorHub;
use crate::writer::OutboundQueue;

/// Terminal output buffered per subscriber before it lags.
const OUTPUT_CAPACITY: usize = 1024;

/// Gateway-wide resources every session uses.
pub(crate) struct SessionContext {
    pub(crate) outbound: OutboundQueue,
    pub(crate) events: EventBus,
    pub(crate) monitors: MonitorHub,
    pub(crate) registry: SessionRegistry,
    pub(crate) ids: CorrelationIds,
    pub(crate) options: GatewayOptions,
}

pub(crate) struct SessionInner {
    pub(crate) id: String,
    pub(crate) server_id: String,
    pub(crate) state: watch::Sender<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    pub(crate) geometry: Mutex<Geometry>,
    pub(crate) monitoring: AtomicBool,
    pub(crate) output: broadcast::Sender<Vec<u8>>,
    /// Cancelled once the session is closed.
    pub(crate) closed: CancellationToken,
    pub(crate) requests: PendingRequests,
    pub(crate) uploads: UploadSlots,
    pub(crate) ctx: std::sync::Arc<SessionContext>,
}

impl SessionInner {
    pub(crate) fn new(
        id: &str,
        server_id: &str,
        geometry: Geometry,
        ctx: std::sync::Arc<SessionContext>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            id: id.to_string(),
            server_id: server_id.to_string(),
            state,
            close_reason: Mutex::new(None),
            geometry: Mutex::new(geometry),
            monitoring: AtomicBool::new(false),
            output,
            closed: CancellationToken::new(),
            requests: PendingRequests::new(id, ctx.ids.clone()),
            uploads: UploadSlots::default(),
            ctx,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn geometry(&self) -> Geometry {
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_reason(&self) -> MutexGuard<'_, Option<CloseReason>> {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The error an operation sees on this closed session.
    pub(crate) fn closed_error(&self) -> GatewayError {
        match self.close_reason().as_ref() {
            Some(reason) => reason.to_error(&self.id, &self.server_id),
            None => GatewayError::closed(&self.id, "closing"),
        }
    }

    pub(crate) fn close_reason_text(&self) -> String {
        match self.close_reason().as_ref() {
            Some(reason) => reason.to_string(),
            None => "closing".to_string(),
        }
    }

    /// Fail unless shell and file commands are currently allowed.
    pub(crate) fn ensure_ready(&self) -> Result<(), GatewayError> {
        match self.state() {
            state if state.accepts_commands() => Ok(()),
            SessionState::Closed => Err(self.closed_error()),
            state => Err(GatewayError::NotReady {
                session_id: self.id.clone(),
                state,
            }),
        }
    }

    /// Queue a message tagged with this session's id.
    pub(crate) async fn send(&self, message: Message) -> Result<(), GatewayError> {
        self.ctx.outbound.send(&self.id, message).await
    }

    /// Apply a state transition and announce it if the state changed.
    fn transition(&self, next: impl FnOnce(SessionState) -> SessionState) {
        let mut change = None;
        self.state.send_if_modified(|state| {
            let new = next(*state);
            if new == *state {
                return false;
            }
            change = Some((*state, new));
            *state = new;
            true
        });
        if let Some((old, new)) = change {
            info!(session_id = %self.id, from = %old, to = %new, "session state changed");
            self.ctx.events.emit(GatewayEvent::StateChanged {
                session_id: self.id.clone(),
                state: new,
            });
        }
    }

    /// Tear the session down without talking to the backend.
    ///
    /// Safe to call from the dispatcher; only the first call has any effect.
    pub(crate) fn terminate(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }

        // Whoever observes `Closed` must find the slot already released.
        self.monitoring.store(false, Ordering::SeqCst);
        self.ctx.monitors.remove(&self.id);
        self.ctx.registry.remove(&self.id, self);
        self.transition(|_| SessionState::Closed);

        // Cancel before rejecting: a request registered after the drain
        // sees the token and fails on its own.
        self.closed.cancel();
        self.uploads.stop_all();
        let rejected = self
            .requests
            .reject_all(&reason.to_error(&self.id, &self.server_id));

        match reason {
            CloseReason::ClientClosed | CloseReason::Shutdown => {
                info!(session_id = %self.id, rejected, "session closed: {}", reason)
            }
            _ => warn!(session_id = %self.id, rejected, "session closed: {}", reason),
        }
    }

    /// Apply one inbound message from the backend.
    pub(crate) fn handle_inbound(&self, message: Message) {
        match message {
            Message::Ready(_) => self.transition(SessionState::on_ready),

            Message::Error(err) => {
                let fatal = err.is_fatal();
                if fatal {
                    error!(session_id = %self.id, code = ?err.code, "backend error: {}", err.message);
                } else {
                    warn!(session_id = %self.id, code = ?err.code, "backend error: {}", err.message);
                }
                self.ctx.events.emit(GatewayEvent::Error {
                    session_id: self.id.clone(),
                    server_id: self.server_id.clone(),
                    code: err.code,
                    message: err.message.clone(),
                    fatal,
                });

                if fatal {
                    self.terminate(CloseReason::Fatal {
                        code: err.code,
                        message: err.message,
                    });
                } else {
                    self.transition(|state| state.on_error(false));
                    self.uploads
                        .fail_all(&format!("{:?}", err.code), &err.message);
                }
            }

            Message::Close(close) => self.terminate(CloseReason::ServerClosed(close.reason)),

            Message::Data(data) => {
                if self.state().accepts_commands() {
                    // No subscriber means nobody is watching the terminal.
                    let _ = self.output.send(data.bytes);
                } else {
                    debug!(session_id = %self.id, state = %self.state(), "discarding terminal data");
                }
            }

            response @ (Message::FileListData(_)
            | Message::FileReadData(_)
            | Message::FileDownloadData(_)
            | Message::FileSuccess(_)
            | Message::FileError(_)) => {
                self.requests.resolve(response);
            }

            Message::UploadStartAck(ack) => {
                self.route_upload(&ack.path, ack.transfer_id, UploadSignal::StartAck)
            }
            Message::UploadChunkAck(ack) => self.route_upload(
                &ack.path,
                ack.transfer_id,
                UploadSignal::ChunkAck { offset: ack.offset },
            ),
            Message::UploadSuccess(done) => {
                self.route_upload(&done.path, done.transfer_id, UploadSignal::Complete)
            }
            Message::UploadError(err) => self.route_upload(
                &err.path,
                err.transfer_id,
                UploadSignal::Failed {
                    code: format!("{:?}", err.code),
                    message: err.message,
                },
            ),

            Message::MonitorData(sample) => self.accept_sample(sample),

            other => {
                warn!(session_id = %self.id, kind = other.kind(), "unexpected message from backend");
            }
        }
    }

    fn route_upload(&self, path: &str, transfer_id: u64, signal: UploadSignal) {
        if !self.uploads.route(path, transfer_id, signal) {
            warn!(session_id = %self.id, path, transfer_id, "upload reply for no running upload");
        }
    }

    fn accept_sample(&self, sample: MonitoringSample) {
        if !self.monitoring.load(Ordering::SeqCst) {
            debug!(session_id = %self.id, "discarding sample, monitoring is off");
            return;
        }
        self.ctx.monitors.update(&self.id, sample);
        self.ctx.events.emit(GatewayEvent::Sample {
            session_id: self.id.clone(),
            sample,
        });
    }
}
