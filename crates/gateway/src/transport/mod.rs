//! Physical transports carrying multiplexed envelopes.
//!
//! A transport is split once into two channel halves:
//! - an outbound sender, drained by exactly one writer task that frames and
//!   writes envelopes in the order they were queued
//! - an inbound receiver yielding decoded envelopes; it ends (or yields an
//!   error) when the physical connection dies
//!
//! Frames that fail to decode are logged and skipped; they never end the
//! inbound stream.

pub mod memory;
pub mod websocket;

use protocol::{Envelope, ProtocolError};
use tokio::sync::mpsc;

pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;

/// Buffer size of the transport channels.
pub const CHANNEL_CAPACITY: usize = 256;

/// Sending half of a transport.
pub type Outbound = mpsc::Sender<Envelope>;

/// Receiving half of a transport.
pub type Inbound = mpsc::Receiver<Result<Envelope, ProtocolError>>;

/// A duplex envelope channel shared by every session.
pub trait Transport: Send + 'static {
    /// Consume the transport, returning its outbound and inbound halves.
    fn split(self) -> (Outbound, Inbound);
}
