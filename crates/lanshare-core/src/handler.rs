//! Connection Handler
//!
//! Drives one peer connection through its lifecycle:
//!
//! ```text
//! Connected ──(listing sent)──► Serving ──(close / read error / shutdown / terminate)──► Closed
//! ```
//!
//! On entering `Connected` the session is registered and the current listing
//! is sent. In `Serving` each `DownloadRequest` is answered on this connection
//! only; unknown names are ignored without a reply, and malformed messages are
//! dropped while the connection stays open. A session terminated by a failed
//! broadcast is closed like one hit by shutdown. The session is deregistered
//! by a drop guard, so it leaves the registry on every exit path, including
//! task abort.

use crate::error::{Result, ShareError};
use crate::listing::SharedDirectory;
use crate::protocol::{Message, ProtocolError};
use crate::registry::{MessageSink, Session, SessionId, SessionRegistry};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, initial listing not yet sent
    Connected,
    /// Processing download requests
    Serving,
    /// Terminal
    Closed,
}

/// Everything a handler needs from the server
#[derive(Clone)]
pub struct HandlerContext {
    /// Shared session registry
    pub registry: Arc<SessionRegistry>,
    /// Shared directory
    pub directory: Arc<dyn SharedDirectory>,
    /// Per-send timeout
    pub send_timeout: Duration,
    /// Slowest payload write tolerated, in bytes per second
    pub min_transfer_rate: u64,
    /// Largest inbound websocket message accepted
    pub max_request_size: usize,
}

/// Time allowed to write an encoded payload of `len` bytes
///
/// `send_timeout` plus the time the payload takes at `min_transfer_rate`.
pub fn payload_deadline(send_timeout: Duration, min_transfer_rate: u64, len: usize) -> Duration {
    let rate = min_transfer_rate.max(1) as f64;
    send_timeout + Duration::from_secs_f64(len as f64 / rate)
}

/// Websocket write half used as a session sink
pub(crate) struct WsSink<S> {
    inner: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
}

impl<S> WsSink<S> {
    pub(crate) fn new(sink: SplitSink<WebSocketStream<S>, WsMessage>) -> Self {
        Self {
            inner: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl<S> MessageSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&self, text: String) -> Result<()> {
        self.inner.lock().await.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.inner.lock().await;
        sink.send(WsMessage::Close(None)).await?;
        sink.close().await?;
        Ok(())
    }
}

/// Deregisters the session when the handler goes away
struct RegistrationGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
    peer_addr: SocketAddr,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        info!("Client {} ({}) disconnected", self.id, self.peer_addr);
    }
}

pub(crate) fn websocket_config(max_request_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_request_size);
    config.max_frame_size = Some(max_request_size);
    config
}

/// Serve one accepted stream until the peer leaves or shutdown is signalled
///
/// # Errors
///
/// Returns an error if the websocket handshake fails or the connection breaks.
/// The session is deregistered in every case.
pub async fn serve_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    ctx: HandlerContext,
    shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handshake = tokio_tungstenite::accept_async_with_config(
        stream,
        Some(websocket_config(ctx.max_request_size)),
    );
    let ws = tokio::time::timeout(ctx.send_timeout, handshake)
        .await
        .map_err(|_| ShareError::Connection("websocket handshake timed out".into()))??;
    let (sink, incoming) = ws.split();

    let id = ctx.registry.next_id();
    let session = Arc::new(Session::new(
        id,
        peer_addr,
        Box::new(WsSink::new(sink)),
        ctx.send_timeout,
    ));

    ctx.registry.add(Arc::clone(&session));
    let _guard = RegistrationGuard {
        registry: Arc::clone(&ctx.registry),
        id,
        peer_addr,
    };
    info!("Client {} connected from {}", id, peer_addr);

    let mut connection = Connection {
        session,
        directory: Arc::clone(&ctx.directory),
        send_timeout: ctx.send_timeout,
        min_transfer_rate: ctx.min_transfer_rate,
        state: ConnectionState::Connected,
    };
    let result = connection.run(incoming, shutdown).await;
    connection.transition(ConnectionState::Closed);
    result
}

struct Connection {
    session: Arc<Session>,
    directory: Arc<dyn SharedDirectory>,
    send_timeout: Duration,
    min_transfer_rate: u64,
    state: ConnectionState,
}

impl Connection {
    async fn run<S>(
        &mut self,
        mut incoming: SplitStream<WebSocketStream<S>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let files = self.directory.list_names().await?;
        self.session.send(&Message::Listing { files }).await?;
        self.transition(ConnectionState::Serving);

        let stopping = *shutdown.borrow();
        if stopping {
            let _ = self.session.close().await;
            return Ok(());
        }

        let session = Arc::clone(&self.session);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    debug!("Closing session {} for shutdown", self.session.id());
                    let _ = self.session.close().await;
                    return Ok(());
                }

                _ = session.terminated() => {
                    debug!("Closing terminated session {}", self.session.id());
                    let _ = self.session.close().await;
                    return Ok(());
                }

                frame = incoming.next() => {
                    let decoded = match frame {
                        None | Some(Ok(WsMessage::Close(_))) => return Ok(()),
                        Some(Err(e)) => {
                            debug!("Read error on session {}: {}", self.session.id(), e);
                            return Err(e.into());
                        }
                        Some(Ok(WsMessage::Text(text))) => Message::decode(&text),
                        Some(Ok(WsMessage::Binary(bytes))) => Message::decode_bytes(&bytes),
                        Some(Ok(_)) => continue,
                    };
                    self.on_message(decoded).await?;
                }
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            "Session {}: {:?} -> {:?}",
            self.session.id(),
            self.state,
            next
        );
        self.state = next;
    }

    async fn on_message(&self, decoded: std::result::Result<Message, ProtocolError>) -> Result<()> {
        match decoded {
            Ok(Message::DownloadRequest { name }) => self.serve_download(&name).await,
            Ok(other) => {
                debug!(
                    "Ignoring unexpected '{}' message from session {}",
                    other.message_type(),
                    self.session.id()
                );
                Ok(())
            }
            Err(e) => {
                debug!("Dropping message from session {}: {}", self.session.id(), e);
                Ok(())
            }
        }
    }

    /// Only connection-level failures are returned; request failures are logged
    async fn serve_download(&self, name: &str) -> Result<()> {
        let bytes = match self.directory.read(name).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                debug!(
                    "Session {} requested {:?}, not in shared folder",
                    self.session.id(),
                    name
                );
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "Failed to read {:?} for session {}: {}",
                    name,
                    self.session.id(),
                    e
                );
                return Ok(());
            }
        };

        let size = bytes.len();
        let sent = match Message::payload(name, bytes).encode() {
            Ok(text) => {
                let deadline =
                    payload_deadline(self.send_timeout, self.min_transfer_rate, text.len());
                self.session.send_within(text, deadline).await
            }
            Err(e) => Err(e.into()),
        };
        match sent {
            Ok(()) => {
                info!(
                    "Sent file {} ({} bytes) to client {}",
                    name,
                    size,
                    self.session.id()
                );
                Ok(())
            }
            Err(ShareError::Protocol(e)) => {
                warn!("Failed to encode {:?}: {}", name, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
