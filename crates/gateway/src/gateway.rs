//! The multiplexing gateway.
//!
//! A [`Gateway`] owns one transport and any number of sessions on it. All
//! outbound traffic goes through a single writer queue; all inbound traffic
//! through a single dispatcher.

use std::sync::Arc;
use std::time::Duration;

use protocol::messages::{Connect, Message, MonitoringSample};
use protocol::ProtocolError;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GatewayOptions;
use crate::dispatcher::spawn_dispatcher;
use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::files::CorrelationIds;
use crate::monitor::MonitorHub;
use crate::session::inner::{SessionContext, SessionInner};
use crate::session::registry::SessionRegistry;
use crate::session::{CloseReason, Geometry, Session, SessionInfo, SessionState};
use crate::transport::Transport;
use crate::writer::spawn_writer;

/// Bound on each farewell message during shutdown.
const SHUTDOWN_SEND_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Gateway {
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    transport_down: CancellationToken,
}

impl Gateway {
    /// Start a gateway over `transport`. Must be called inside a Tokio runtime.
    pub fn new<T: Transport>(transport: T, options: GatewayOptions) -> Self {
        let (outbound, inbound) = transport.split();
        let shutdown = CancellationToken::new();
        let transport_down = CancellationToken::new();

        let ctx = Arc::new(SessionContext {
            outbound: spawn_writer(outbound, shutdown.clone()),
            events: EventBus::new(),
            monitors: MonitorHub::new(),
            registry: SessionRegistry::default(),
            ids: CorrelationIds::default(),
            options,
        });
        spawn_dispatcher(
            inbound,
            Arc::clone(&ctx),
            shutdown.clone(),
            transport_down.clone(),
        );

        Self {
            ctx,
            shutdown,
            transport_down,
        }
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.ctx.options
    }

    /// Whether the transport is still usable.
    pub fn is_connected(&self) -> bool {
        !self.transport_down.is_cancelled() && !self.ctx.outbound.is_closed()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::Transport(ProtocolError::ConnectionClosed(
                "transport closed".to_string(),
            )))
        }
    }

    /// Open a session to `server_id`.
    ///
    /// The session id is the server id. Opening an id that is already live
    /// returns the existing session and sends nothing. The returned session
    /// starts `Connecting`; use [`Session::wait_ready`] to wait for the
    /// backend.
    pub async fn open(&self, server_id: &str, geometry: Option<Geometry>) -> Result<Session> {
        self.ensure_connected()?;
        let geometry = geometry.unwrap_or(self.ctx.options.default_geometry);

        let (inner, created) = self.ctx.registry.get_or_insert_with(server_id, || {
            Arc::new(SessionInner::new(
                server_id,
                server_id,
                geometry,
                Arc::clone(&self.ctx),
            ))
        });
        if !created {
            return Ok(Session::from_inner(inner));
        }

        // The dispatcher may have swept the registry just before the insert.
        if self.transport_down.is_cancelled() {
            inner.terminate(CloseReason::TransportClosed("transport closed".to_string()));
            return Err(GatewayError::Transport(ProtocolError::ConnectionClosed(
                "transport closed".to_string(),
            )));
        }

        info!(session_id = %inner.id, cols = geometry.cols, rows = geometry.rows, "opening session");
        self.ctx.events.emit(GatewayEvent::StateChanged {
            session_id: inner.id.clone(),
            state: SessionState::Connecting,
        });
        spawn_connect_watchdog(Arc::clone(&inner));

        let connect = Message::Connect(Connect {
            server_id: server_id.to_string(),
            cols: geometry.cols,
            rows: geometry.rows,
        });
        if let Err(e) = inner.send(connect).await {
            inner.terminate(CloseReason::TransportClosed(e.to_string()));
            return Err(e);
        }
        Ok(Session::from_inner(inner))
    }

    /// Subscribe to gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.ctx.events.subscribe()
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.ctx.registry.get(session_id).map(Session::from_inner)
    }

    /// Snapshot of every open session.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .ctx
            .registry
            .all()
            .into_iter()
            .map(|inner| Session::from_inner(inner).info())
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    pub fn session_count(&self) -> usize {
        self.ctx.registry.len()
    }

    /// Latest monitoring sample for `session_id`.
    pub fn latest_sample(&self, session_id: &str) -> Option<MonitoringSample> {
        self.ctx.monitors.latest(session_id)
    }

    /// Close every session, then stop the writer and dispatcher.
    pub async fn shutdown(&self) {
        // Refuse new sessions while the existing ones are closed.
        self.transport_down.cancel();
        let sessions = self.ctx.registry.all();
        info!(sessions = sessions.len(), "shutting down gateway");
        for inner in sessions {
            let session = Session::from_inner(inner);
            if let Err(e) = session
                .close_with(CloseReason::Shutdown, SHUTDOWN_SEND_TIMEOUT)
                .await
            {
                warn!(session_id = %session.id(), "close during shutdown failed: {}", e);
            }
        }
        self.shutdown.cancel();
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Close the session if `ready` does not arrive within the connect timeout.
fn spawn_connect_watchdog(inner: Arc<SessionInner>) {
    let connect_timeout = inner.ctx.options.connect_timeout;
    tokio::spawn(async move {
        let mut states = inner.state.subscribe();
        let timed_out = tokio::time::timeout(
            connect_timeout,
            states.wait_for(|state| *state != SessionState::Connecting),
        )
        .await
        .is_err();
        if !timed_out {
            return;
        }

        warn!(session_id = %inner.id, timeout = ?connect_timeout, "no ready from backend");
        let close = Message::Close(protocol::messages::Close {
            reason: Some("connect timeout".to_string()),
        });
        if tokio::time::timeout(SHUTDOWN_SEND_TIMEOUT, inner.send(close))
            .await
            .is_err()
        {
            warn!(session_id = %inner.id, "could not send close after connect timeout");
        }
        inner.terminate(CloseReason::ConnectTimeout);
    });
}
