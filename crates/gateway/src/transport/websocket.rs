//! WebSocket transport to the backend.
//!
//! One binary WebSocket message carries exactly one frame. Text messages are
//! not part of the protocol and are ignored.

use futures_util::{SinkExt, StreamExt};
use protocol::{FrameCodec, ProtocolError};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use url::Url;

use super::{Inbound, Outbound, Transport, CHANNEL_CAPACITY};

/// A connected WebSocket transport.
pub struct WebSocketTransport {
    outbound: Outbound,
    inbound: Inbound,
}

/// Check that `url` is a WebSocket URL.
pub fn parse_url(url: &str) -> Result<Url, ProtocolError> {
    let parsed = Url::parse(url)
        .map_err(|e| ProtocolError::ConnectionClosed(format!("invalid url {url}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(ProtocolError::ConnectionClosed(format!(
            "unsupported url scheme {other}, expected ws or wss"
        ))),
    }
}

impl WebSocketTransport {
    /// Connect to `url` and start the reader and writer tasks.
    pub async fn connect(url: &str, compression: bool) -> Result<Self, ProtocolError> {
        let url = parse_url(url)?;

        tracing::info!("Connecting to backend: {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| match e {
            WsError::Io(io_err) => ProtocolError::from(io_err),
            _ => ProtocolError::ConnectionClosed(format!("WebSocket connection failed: {}", e)),
        })?;

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (outbound, mut queued) = mpsc::channel(CHANNEL_CAPACITY);
        let (delivered, inbound) = mpsc::channel(CHANNEL_CAPACITY);

        let codec = FrameCodec::with_compression(compression);
        let writer_codec = codec.clone();
        tokio::spawn(async move {
            while let Some(envelope) = queued.recv().await {
                let frame = match writer_codec.encode_envelope(&envelope) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(session_id = %envelope.session_id, "failed to encode envelope: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(WsMessage::Binary(frame)).await {
                    tracing::error!("failed to send WebSocket message: {}", e);
                    return;
                }
            }
            // Every sender is gone: the gateway is shutting down.
            let _ = ws_sink.send(WsMessage::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(result) = ws_stream.next().await {
                match result {
                    Ok(WsMessage::Binary(frame)) => match codec.decode_envelope(&frame) {
                        Ok(envelope) => {
                            if delivered.send(Ok(envelope)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("discarding undecodable frame: {}", e),
                    },
                    Ok(WsMessage::Text(text)) => {
                        tracing::warn!(len = text.len(), "ignoring text message from backend");
                    }
                    Ok(WsMessage::Close(_)) => {
                        let _ = delivered
                            .send(Err(ProtocolError::ConnectionClosed(
                                "server closed connection".to_string(),
                            )))
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = delivered
                            .send(Err(ProtocolError::ConnectionClosed(format!(
                                "WebSocket error: {}",
                                e
                            ))))
                            .await;
                        break;
                    }
                    _ => {
                        // Ping/pong are answered by tungstenite
                    }
                }
            }
        });

        Ok(Self { outbound, inbound })
    }
}

impl Transport for WebSocketTransport {
    fn split(self) -> (Outbound, Inbound) {
        (self.outbound, self.inbound)
    }
}
