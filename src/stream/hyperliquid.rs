//! Hyperliquid websocket transport.

use super::{ping_message, subscribe_message, Frame, StreamConnector, StreamError, StreamSession};
use crate::domain::Address;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `userFills` subscriptions against the exchange websocket.
#[derive(Debug, Clone)]
pub struct HyperliquidStreamConnector {
    url: String,
}

impl HyperliquidStreamConnector {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl StreamConnector for HyperliquidStreamConnector {
    async fn connect(&self, user: &Address) -> Result<Box<dyn StreamSession>, StreamError> {
        let (mut ws, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        info!(url = %self.url, status = %response.status(), "Websocket connected");

        ws.send(Message::Text(subscribe_message(user)))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        debug!(user = %user, "Subscription requested");

        Ok(Box::new(WsSession { ws }))
    }
}

struct WsSession {
    ws: WsStream,
}

#[async_trait]
impl StreamSession for WsSession {
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
        match self.ws.next().await? {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
            Ok(Message::Binary(bytes)) => Some(
                String::from_utf8(bytes)
                    .map(Frame::Text)
                    .map_err(|e| StreamError::Deserialization(e.to_string())),
            ),
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Websocket closed by peer");
                None
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => Some(Ok(Frame::Keepalive)),
            Err(e) => Some(Err(StreamError::Transport(e.to_string()))),
        }
    }

    async fn ping(&mut self) -> Result<(), StreamError> {
        self.ws
            .send(Message::Text(ping_message()))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "Websocket close failed");
        }
    }
}
