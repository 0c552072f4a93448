//! Push channel transport

use async_trait::async_trait;
use futures_util::StreamExt;
use rehearsekit_shared::{RehearseError, Result};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// Application-level frame read from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Peer initiated close
    Close,
}

/// An open, receive-only push channel
#[async_trait]
pub trait Channel: Send {
    /// Next frame, or `None` once the underlying stream has ended
    async fn next_frame(&mut self) -> Option<Result<Frame>>;

    /// Close the channel from our side
    async fn close(&mut self);
}

/// Opens push channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<Box<dyn Channel>>;
}

/// tokio-tungstenite connector (ws:// and wss:// via rustls)
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<Box<dyn Channel>> {
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| RehearseError::Channel(format!("handshake with {url} failed: {e}")))?;

        debug!("Handshake with {} answered {}", url, response.status());
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(RehearseError::Channel(e.to_string()))),
            };

            match message {
                Message::Text(text) => {
                    debug!("Received raw message: {}", text);
                    return Some(Ok(Frame::Text(text)));
                }
                Message::Binary(bytes) => return Some(Ok(Frame::Binary(bytes))),
                Message::Close(frame) => {
                    debug!("Peer closed channel: {:?}", frame);
                    return Some(Ok(Frame::Close));
                }
                // Pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Closing channel failed: {}", e);
        }
    }
}
