//! # termgate Gateway Library
//!
//! Multiplexes many remote terminal sessions, their file channels and their
//! resource monitoring over a single transport to a backend that holds the
//! actual SSH connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │  Session A  │ │  Session B  │ │  Session C  │   Session handles
//! └──────┬──────┘ └──────┬──────┘ └──────┬──────┘
//!        │               │               │
//! ┌──────▼───────────────▼───────────────▼──────┐
//! │   Writer queue (stamps sequence numbers)    │
//! └──────────────────────┬──────────────────────┘
//!                        │   ▲
//!                        ▼   │ Dispatcher (routes by session id)
//! ┌─────────────────────────────────────────────┐
//! │        Transport (WebSocket / memory)       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway::{Gateway, GatewayOptions, WebSocketTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = WebSocketTransport::connect("ws://127.0.0.1:8022/ws", true).await?;
//!     let gateway = Gateway::new(transport, GatewayOptions::default());
//!
//!     let session = gateway.open("server-a", None).await?;
//!     session.wait_ready().await?;
//!
//!     for entry in session.list("/root").await? {
//!         println!("{}", entry.name);
//!     }
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: Session registry and lifecycle entry points
//! - [`session`]: Per-session handle and state machine
//! - [`files`]: File commands and chunked uploads
//! - [`monitor`]: Latest resource sample per session
//! - [`transport`]: WebSocket and in-memory transports
//! - [`config`]: TOML configuration
//! - [`logging`]: Tracing setup

pub mod config;
mod dispatcher;
pub mod error;
pub mod events;
pub mod files;
pub mod gateway;
pub mod logging;
pub mod monitor;
pub mod session;
pub mod transport;
pub mod writer;

pub use config::{Config, ConfigError, GatewayOptions};
pub use error::{
    FileErrorKind, FileOpError, GatewayError, Result, UploadError, UploadFailure,
};
pub use events::GatewayEvent;
pub use files::{parent_dir, Refresh, UploadOutcome, UploadState};
pub use gateway::Gateway;
pub use monitor::MonitorHub;
pub use session::{CloseReason, Geometry, Session, SessionInfo, SessionState};
pub use transport::{MemoryTransport, Transport, WebSocketTransport};

pub use protocol::messages::{FileEntry, MonitoringSample};
pub use protocol::{Envelope, ErrorCode, Message};
