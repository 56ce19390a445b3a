//! Peer client for connecting to a lanshare server.
//!
//! Speaks the same protocol as the server: receives listings, sends download
//! requests and waits for the matching payload. Used by the command-line
//! shell and the integration tests.

use crate::error::{Result, ShareError};
use crate::protocol::Message;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Largest inbound message the client accepts (a base64 payload of a large file)
pub const MAX_CLIENT_MESSAGE_SIZE: usize = 1 << 30;

/// Connected peer
pub struct PeerClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    listing: Option<Vec<String>>,
}

impl PeerClient {
    /// Connect to a server at a `ws://host:port` URL
    ///
    /// # Errors
    ///
    /// Returns a connection error if the TCP connect or websocket handshake
    /// fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_CLIENT_MESSAGE_SIZE);
        config.max_frame_size = None;

        let (ws, _) = tokio_tungstenite::connect_async_with_config(url, Some(config), true).await?;
        debug!("Connected to {}", url);

        Ok(Self { ws, listing: None })
    }

    /// Most recent listing received, if any
    pub fn listing(&self) -> Option<&[String]> {
        self.listing.as_deref()
    }

    /// Next decoded message, or `None` once the server closes
    ///
    /// Frames that fail to decode are skipped.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        while let Some(frame) = self.ws.next().await {
            let decoded = match frame {
                Ok(WsMessage::Text(text)) => Message::decode(&text),
                Ok(WsMessage::Binary(bytes)) => Message::decode_bytes(&bytes),
                Ok(WsMessage::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            match decoded {
                Ok(message) => {
                    if let Message::Listing { files } = &message {
                        self.listing = Some(files.clone());
                    }
                    return Ok(Some(message));
                }
                Err(e) => debug!("Skipping undecodable frame: {}", e),
            }
        }
        Ok(None)
    }

    /// Ask the server for a file
    pub async fn request(&mut self, name: &str) -> Result<()> {
        self.send(&Message::download(name)).await
    }

    /// Send any protocol message
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.send_raw(message.encode()?).await
    }

    /// Send an arbitrary text frame
    pub async fn send_raw(&mut self, text: String) -> Result<()> {
        self.ws.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Wait up to `wait` for the next listing
    ///
    /// Returns `Ok(None)` on timeout.
    pub async fn wait_for_listing(&mut self, wait: Duration) -> Result<Option<Vec<String>>> {
        match tokio::time::timeout(wait, self.next_listing()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Request `name` and wait up to `wait` for its contents
    ///
    /// Listings that arrive meanwhile are recorded and skipped. Returns
    /// `Ok(None)` if nothing arrives in time, which is how the server answers
    /// a name it does not have.
    pub async fn fetch(&mut self, name: &str, wait: Duration) -> Result<Option<Vec<u8>>> {
        self.request(name).await?;

        match tokio::time::timeout(wait, self.next_payload(name)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn next_listing(&mut self) -> Result<Vec<String>> {
        loop {
            match self.next_message().await? {
                Some(Message::Listing { files }) => return Ok(files),
                Some(_) => continue,
                None => return Err(ShareError::Connection("server closed".into())),
            }
        }
    }

    async fn next_payload(&mut self, name: &str) -> Result<Vec<u8>> {
        loop {
            match self.next_message().await? {
                Some(Message::FilePayload { name: got, bytes }) if got == name => {
                    return Ok(bytes);
                }
                Some(_) => continue,
                None => return Err(ShareError::Connection("server closed".into())),
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
