use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Result, SyncError};

/// Dials the live channel. Production uses [`WsTransport`]; tests inject
/// scripted fakes so the reconnect machine can be exercised without sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str, credential: &str)
        -> Result<Box<dyn TransportConnection>>;
}

/// One established bidirectional connection carrying text frames.
#[async_trait]
pub trait TransportConnection: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next inbound text frame. `None` means the connection is gone, whether
    /// closed cleanly or torn down; the caller treats both as a drop.
    async fn recv(&mut self) -> Option<String>;

    async fn close(&mut self);
}

/// WebSocket transport. The bearer credential travels in the upgrade
/// request; a 401/403 upgrade rejection is an auth failure, everything else
/// a transport failure.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        url: &str,
        credential: &str,
    ) -> Result<Box<dyn TransportConnection>> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SyncError::Transport(format!("invalid channel url: {e}")))?;
        let header = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|e| SyncError::Auth(format!("credential not header-safe: {e}")))?;
        request.headers_mut().insert("Authorization", header);

        match connect_async(request).await {
            Ok((stream, _)) => {
                let (sink, source) = stream.split();
                Ok(Box::new(WsConnection { sink, source }))
            }
            Err(WsError::Http(response))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Err(SyncError::Auth(format!(
                    "handshake rejected: {}",
                    response.status()
                )))
            }
            Err(e) => Err(SyncError::Transport(e.to_string())),
        }
    }
}

struct WsConnection {
    sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    source: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<String> {
        while let Some(msg) = self.source.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("Live channel read error: {e}");
                    return None;
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}
