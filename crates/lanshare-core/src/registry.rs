//! Session Registry
//!
//! Tracks the currently connected peer sessions. It is the only state shared
//! between the accept loop, the per-peer handlers and the change-notification
//! path.
//!
//! Sessions are stored in a concurrent `DashMap` keyed by [`SessionId`].
//! Broadcast iterates a snapshot of the map taken up front, so a peer that
//! disconnects mid-broadcast only shows up as one failed send. A session whose
//! broadcast send fails is removed and terminated; its handler watches
//! [`Session::terminated`] and closes the connection.

use crate::error::{Result, ShareError};
use crate::protocol::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

/// Outbound half of a peer connection
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send one text frame
    async fn send_text(&self, text: String) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Session identifier, unique for the lifetime of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One live connection to a peer
///
/// Writes are serialized through a gate. Waiting for the gate does not count
/// against a write's deadline, so a listing queued behind a large payload is
/// not mistaken for a stalled peer.
pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    sink: Box<dyn MessageSink>,
    send_timeout: Duration,
    write_gate: Mutex<()>,
    terminate_tx: watch::Sender<bool>,
}

impl Session {
    /// Create a session writing through `sink`
    pub fn new(
        id: SessionId,
        peer_addr: SocketAddr,
        sink: Box<dyn MessageSink>,
        send_timeout: Duration,
    ) -> Self {
        let (terminate_tx, _) = watch::channel(false);
        Self {
            id,
            peer_addr,
            sink,
            send_timeout,
            write_gate: Mutex::new(()),
            terminate_tx,
        }
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the peer
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Encode and send one message to this peer only
    ///
    /// # Errors
    ///
    /// Returns `SendTimeout` if the write does not finish in time, or a
    /// connection error if the peer is gone.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_encoded(message.encode()?).await
    }

    /// Send an already encoded message within the session's send timeout
    pub async fn send_encoded(&self, text: String) -> Result<()> {
        self.send_within(text, self.send_timeout).await
    }

    /// Send an already encoded message, allowing `deadline` for the write
    ///
    /// # Errors
    ///
    /// Returns `SendTimeout` if the write takes longer than `deadline`.
    pub async fn send_within(&self, text: String, deadline: Duration) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        tokio::time::timeout(deadline, self.sink.send_text(text))
            .await
            .map_err(|_| ShareError::SendTimeout)?
    }

    /// Close the underlying connection
    ///
    /// A peer that stopped reading cannot take the close frame, so the
    /// attempt is bounded by the send timeout.
    pub async fn close(&self) -> Result<()> {
        tokio::time::timeout(self.send_timeout, self.sink.close())
            .await
            .map_err(|_| ShareError::SendTimeout)?
    }

    /// Ask the session's handler to drop the connection
    pub fn terminate(&self) {
        self.terminate_tx.send_replace(true);
    }

    /// Whether [`Session::terminate`] has been called
    pub fn is_terminated(&self) -> bool {
        *self.terminate_tx.borrow()
    }

    /// Resolves once the session has been terminated
    pub async fn terminated(&self) {
        let mut rx = self.terminate_tx.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|terminated| *terminated).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the message reached
    pub delivered: usize,
    /// Sessions whose send failed; they have been removed and terminated
    pub failed: Vec<SessionId>,
}

/// Set of currently connected sessions
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh session identifier
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a session
    ///
    /// Returns `false` if a session with the same id was already present
    /// (the registry is left unchanged).
    pub fn add(&self, session: Arc<Session>) -> bool {
        let id = session.id();
        match self.sessions.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                debug!("Registered session {}", id);
                true
            }
        }
    }

    /// Deregister a session; a no-op if it is not present
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if removed.is_some() {
            debug!("Deregistered session {}", id);
        }
        removed
    }

    /// Whether a session is registered
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Copy of the current membership
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Send `message` to every registered session
    ///
    /// Sends run concurrently and independently. A failed send removes and
    /// terminates that session and does not affect delivery to the others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the message cannot be encoded.
    pub async fn broadcast(&self, message: &Message) -> Result<BroadcastReport> {
        let text = message.encode()?;
        let targets = self.snapshot();

        let results = join_all(targets.iter().map(|session| {
            let text = text.clone();
            async move { (session, session.send_encoded(text).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (session, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Broadcast to client {} ({}) failed: {}",
                        session.id(),
                        session.peer_addr(),
                        e
                    );
                    self.remove(session.id());
                    session.terminate();
                    report.failed.push(session.id());
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    /// Sink that records frames and can be switched to fail
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Arc<Mutex<Vec<String>>>,
        pub(crate) broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_text(&self, text: String) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ShareError::Connection("connection reset".into()));
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.broken.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StalledSink;

    #[async_trait]
    impl MessageSink for StalledSink {
        async fn send_text(&self, _text: String) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    type SinkHandles = (Arc<Mutex<Vec<String>>>, Arc<AtomicBool>);

    fn session(registry: &SessionRegistry) -> (Arc<Session>, SinkHandles) {
        let sink = RecordingSink::default();
        let handles = (Arc::clone(&sink.sent), Arc::clone(&sink.broken));
        let session = Session::new(
            registry.next_id(),
            "127.0.0.1:9000".parse().unwrap(),
            Box::new(sink),
            Duration::from_secs(1),
        );
        (Arc::new(session), handles)
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = SessionRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "#1");
    }

    #[test]
    fn test_add_remove_idempotent() {
        let registry = SessionRegistry::new();
        let (s, _) = session(&registry);
        let id = s.id();

        assert!(registry.add(Arc::clone(&s)));
        assert!(!registry.add(Arc::clone(&s)));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let registry = SessionRegistry::new();
        let mut handless = Vec::new();
        for _ in 0..3 {
            let (s, handles) = session(&registry);
            registry.add(s);
            handless.push(handles);
        }

        let report = registry
            .broadcast(&Message::listing(["a.txt"]))
            .await
            .unwrap();

        assert_eq!(report.delivered, 3);
        assert!(report.failed.is_empty());
        for (sent, _) in handless {
            assert_eq!(
                sent.lock().unwrap().as_slice(),
                [r#"{"type":"list","files":["a.txt"]}"#.to_string()]
            );
        }
    }

    #[tokio::test]
    async fn test_broadcast_removes_broken_session() {
        let registry = SessionRegistry::new();
        let (good, (good_sent, _)) = session(&registry);
        let (bad, (_, bad_broken)) = session(&registry);
        let bad_id = bad.id();
        registry.add(good);
        registry.add(bad);

        bad_broken.store(true, Ordering::SeqCst);
        let report = registry.broadcast(&Message::listing(["x"])).await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![bad_id]);
        assert!(!registry.contains(bad_id));
        assert_eq!(registry.len(), 1);
        assert_eq!(good_sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_broadcast_terminates_session() {
        let registry = SessionRegistry::new();
        let (good, _) = session(&registry);
        let (bad, (_, bad_broken)) = session(&registry);
        registry.add(Arc::clone(&good));
        registry.add(Arc::clone(&bad));

        bad_broken.store(true, Ordering::SeqCst);
        registry.broadcast(&Message::listing(["x"])).await.unwrap();

        assert!(bad.is_terminated());
        assert!(!good.is_terminated());
        tokio::time::timeout(Duration::from_secs(1), bad.terminated())
            .await
            .expect("terminated() should resolve after a failed broadcast");
    }

    /// Sink whose writes take a fixed time
    struct SlowSink(Duration);

    #[async_trait]
    impl MessageSink for SlowSink {
        async fn send_text(&self, _text: String) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn slow_session(registry: &SessionRegistry, write: Duration) -> Arc<Session> {
        Arc::new(Session::new(
            registry.next_id(),
            "127.0.0.1:9002".parse().unwrap(),
            Box::new(SlowSink(write)),
            Duration::from_millis(100),
        ))
    }

    #[tokio::test]
    async fn test_send_within_extends_deadline() {
        let registry = SessionRegistry::new();
        let slow = slow_session(&registry, Duration::from_millis(300));

        assert!(matches!(
            slow.send_encoded("x".to_string()).await,
            Err(ShareError::SendTimeout)
        ));
        slow.send_within("x".to_string(), Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_waits_behind_long_write() {
        let registry = SessionRegistry::new();
        let slow = slow_session(&registry, Duration::from_millis(60));
        registry.add(Arc::clone(&slow));

        // Several writes queue on the gate; none may time out while waiting
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let slow = Arc::clone(&slow);
                tokio::spawn(async move { slow.send_encoded("x".to_string()).await })
            })
            .collect();
        let report = registry.broadcast(&Message::listing(["x"])).await.unwrap();

        assert_eq!(report.delivered, 1);
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert!(!slow.is_terminated());
    }

    #[tokio::test]
    async fn test_broadcast_times_out_stalled_session() {
        let registry = SessionRegistry::new();
        let (good, (good_sent, _)) = session(&registry);
        let stalled = Arc::new(Session::new(
            registry.next_id(),
            "127.0.0.1:9001".parse().unwrap(),
            Box::new(StalledSink),
            Duration::from_millis(50),
        ));
        let stalled_id = stalled.id();
        registry.add(good);
        registry.add(stalled);

        let report = registry.broadcast(&Message::listing(["x"])).await.unwrap();

        assert_eq!(report.failed, vec![stalled_id]);
        assert_eq!(good_sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_empty_registry() {
        let registry = SessionRegistry::new();
        let report = registry.broadcast(&Message::listing(["x"])).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
    }
}
