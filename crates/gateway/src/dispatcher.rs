//! Inbound routing.
//!
//! One task reads the transport and hands each envelope to the session it
//! names, in arrival order. When the transport ends, every session is closed.

use std::sync::Arc;

use protocol::messages::Message;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::GatewayEvent;
use crate::session::inner::SessionContext;
use crate::session::CloseReason;
use crate::transport::Inbound;

/// Start routing `inbound` to the sessions in `ctx`.
///
/// `transport_down` is cancelled before sessions are torn down, so an `open`
/// racing the teardown either sees it or is swept by it.
pub(crate) fn spawn_dispatcher(
    mut inbound: Inbound,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    transport_down: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break "gateway shut down".to_string(),
                next = inbound.recv() => next,
            };
            match next {
                Some(Ok(envelope)) => dispatch(&ctx, envelope.session_id, envelope.payload),
                Some(Err(e)) => break e.to_string(),
                None => break "transport ended".to_string(),
            }
        };

        transport_down.cancel();
        let sessions = ctx.registry.all();
        if !sessions.is_empty() {
            warn!(sessions = sessions.len(), "closing sessions: {}", reason);
        }
        for session in sessions {
            session.terminate(CloseReason::TransportClosed(reason.clone()));
        }
        ctx.events.emit(GatewayEvent::TransportClosed {
            reason: reason.clone(),
        });
        info!("dispatcher stopped: {}", reason);
    })
}

fn dispatch(ctx: &SessionContext, session_id: String, payload: Message) {
    let Some(session) = ctx.registry.get(&session_id) else {
        // Late samples and replies for closed sessions land here.
        debug!(session_id = %session_id, kind = payload.kind(), "discarding message for unknown session");
        return;
    };
    session.handle_inbound(payload);
}
