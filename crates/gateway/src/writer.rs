//! The single writer queue shared by all sessions.
//!
//! Sessions never touch the transport directly. They push `(session_id,
//! message)` pairs into one queue; one writer task stamps each with the next
//! sequence number and hands it to the transport. Messages queued by one task
//! therefore reach the backend in the order they were queued.

use protocol::messages::Message;
use protocol::{Envelope, ProtocolError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::GatewayError;
use crate::transport::{Outbound, CHANNEL_CAPACITY};

/// Cloneable handle for queueing outbound messages.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<(String, Message)>,
}

impl OutboundQueue {
    /// Queue `payload` for `session_id`.
    pub async fn send(&self, session_id: &str, payload: Message) -> Result<(), GatewayError> {
        self.tx
            .send((session_id.to_string(), payload))
            .await
            .map_err(|_| {
                GatewayError::Transport(ProtocolError::ConnectionClosed(
                    "writer queue closed".to_string(),
                ))
            })
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the writer task draining into `transport`.
///
/// The task stops when the transport refuses a write, when `shutdown` fires,
/// or when every queue handle has been dropped.
pub fn spawn_writer(transport: Outbound, shutdown: CancellationToken) -> OutboundQueue {
    let (tx, mut rx) = mpsc::channel::<(String, Message)>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut sequence: u64 = 0;
        loop {
            // Drain what is already queued before honouring shutdown.
            let next = tokio::select! {
                biased;
                next = rx.recv() => next,
                _ = shutdown.cancelled() => break,
            };
            let Some((session_id, payload)) = next else {
                break;
            };

            sequence += 1;
            debug!(session_id = %session_id, sequence, kind = payload.kind(), "writing message");
            if transport
                .send(Envelope::new(session_id, sequence, payload))
                .await
                .is_err()
            {
                error!("transport closed, stopping writer");
                break;
            }
        }
        debug!("writer task finished");
    });

    OutboundQueue { tx }
}
