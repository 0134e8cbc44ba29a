//! In-process transport pair.
//!
//! Each direction carries encoded frames, so envelopes go through the same
//! codec path as on a real connection. Dropping both halves of one end closes
//! the other end's inbound stream.

use protocol::FrameCodec;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Inbound, Outbound, Transport, CHANNEL_CAPACITY};

/// One end of an in-memory duplex transport.
pub struct MemoryTransport {
    outbound: Outbound,
    inbound: Inbound,
}

impl MemoryTransport {
    /// Create two connected ends with compression enabled.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        Self::pair_with_codec(FrameCodec::new())
    }

    /// Create two connected ends using `codec` in both directions.
    pub fn pair_with_codec(codec: FrameCodec) -> (MemoryTransport, MemoryTransport) {
        let (a_to_b, b_from_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_to_a, a_from_b) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self::end(codec.clone(), a_to_b, a_from_b),
            Self::end(codec, b_to_a, b_from_a),
        )
    }

    fn end(
        codec: FrameCodec,
        wire_tx: mpsc::Sender<Vec<u8>>,
        mut wire_rx: mpsc::Receiver<Vec<u8>>,
    ) -> MemoryTransport {
        let (outbound, mut queued) = mpsc::channel(CHANNEL_CAPACITY);
        let (delivered, inbound) = mpsc::channel(CHANNEL_CAPACITY);

        let writer_codec = codec.clone();
        tokio::spawn(async move {
            while let Some(envelope) = queued.recv().await {
                match writer_codec.encode_envelope(&envelope) {
                    Ok(frame) => {
                        if wire_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(session_id = %envelope.session_id, "dropping unencodable envelope: {}", e),
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = wire_rx.recv().await {
                match codec.decode_envelope(&frame) {
                    Ok(envelope) => {
                        if delivered.send(Ok(envelope)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("discarding undecodable frame: {}", e),
                }
            }
        });

        MemoryTransport { outbound, inbound }
    }
}

impl Transport for MemoryTransport {
    fn split(self) -> (Outbound, Inbound) {
        (self.outbound, self.inbound)
    }
}
