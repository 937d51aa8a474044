use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{LinkEvent, SignalingConnector, SignalingLink, TransportError};

/// Relay connection over a websocket. One writer task drains the outbound
/// queue; one reader task forwards text frames.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &Url) -> Result<SignalingLink, TransportError> {
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(connect_error)?;
        tracing::debug!(target = "room404::signaling", url = %endpoint, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<LinkEvent>();

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::debug!(target = "room404::signaling", "ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "room404::signaling", "signaling websocket closed: {err}");
                                let _ = inbound_tx.send(LinkEvent::Closed);
                            }
                            _ => {
                                tracing::warn!(target = "room404::signaling", "signaling websocket error: {err}");
                                let _ = inbound_tx.send(LinkEvent::Errored(err.to_string()));
                            }
                        }
                        return;
                    }
                };
                if inbound_tx.send(LinkEvent::Frame(text)).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(LinkEvent::Closed);
        });

        Ok(SignalingLink::new(outbound_tx, inbound_rx).with_tasks(vec![writer, reader]))
    }
}

fn connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => TransportError::Refused(response.status().to_string()),
        WsError::Url(err) => TransportError::InvalidEndpoint(err.to_string()),
        other => TransportError::Connect(other.to_string()),
    }
}
