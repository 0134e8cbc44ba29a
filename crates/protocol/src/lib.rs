//! # termgate Protocol Library
//!
//! Message vocabulary and frame codec shared by the termgate gateway and the
//! backend it talks to.
//!
//! ## Overview
//!
//! One transport carries the traffic of many terminal sessions. Every message
//! is wrapped in an [`Envelope`] tagged with the session it belongs to, then
//! MessagePack-encoded and framed:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Envelope { session_id, payload }      │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │         Transport (WebSocket)           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, FrameCodec, Message};
//! use protocol::messages::Connect;
//!
//! let message = Message::Connect(Connect {
//!     server_id: "server-a".to_string(),
//!     cols: 80,
//!     rows: 24,
//! });
//! let envelope = Envelope::new("server-a", 1, message);
//!
//! let codec = FrameCodec::new();
//! let wire = codec.encode_envelope(&envelope).unwrap();
//! assert_eq!(codec.decode_envelope(&wire).unwrap(), envelope);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`framing`]: Frame codec with compression
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use messages::{Envelope, ErrorCode, FileErrorCode, Message, PROTOCOL_VERSION};
