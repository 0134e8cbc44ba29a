//! Multiplexed sessions.
//!
//! A session is one remote shell plus its file channel and optional
//! monitoring, identified on the wire by its session id. Sessions are opened
//! through [`Gateway::open`](crate::Gateway::open) and driven by inbound
//! control messages; see [`state`] for the lifecycle.

mod handle;
pub(crate) mod inner;
pub(crate) mod registry;
pub mod state;

pub use handle::{Session, SessionInfo};
pub use state::{CloseReason, Geometry, SessionState};
