//! Events published on the gateway's broadcast bus.

use protocol::messages::MonitoringSample;
use protocol::ErrorCode;
use tokio::sync::broadcast;

use crate::files::Refresh;
use crate::session::SessionState;

/// Capacity of the event bus; slow subscribers observe `Lagged`.
pub const EVENT_CAPACITY: usize = 256;

/// Events emitted by the gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A session moved to a new lifecycle state.
    StateChanged {
        session_id: String,
        state: SessionState,
    },
    /// The backend reported an error for a session.
    Error {
        session_id: String,
        server_id: String,
        code: ErrorCode,
        message: String,
        fatal: bool,
    },
    /// A chunk of an upload was acknowledged.
    UploadProgress {
        session_id: String,
        path: String,
        bytes_acknowledged: u64,
        total_bytes: u64,
    },
    /// An upload completed; the caller should re-list `refresh`.
    UploadFinished {
        session_id: String,
        path: String,
        refresh: Refresh,
    },
    /// An upload was aborted.
    UploadFailed {
        session_id: String,
        path: String,
        message: String,
    },
    /// A fresh monitoring sample was accepted for a session.
    Sample {
        session_id: String,
        sample: MonitoringSample,
    },
    /// The shared transport is gone; every session has been closed.
    TransportClosed { reason: String },
}

/// Sending half of the event bus.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub(crate) fn emit(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }
}
