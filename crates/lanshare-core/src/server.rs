//! Server Loop
//!
//! Owns the listening socket, accepts peers and runs one handler task per
//! connection. `notify_changed` is the entry point for "the shared folder
//! changed" and may be called from any task (or, through
//! [`FileServer::notify_changed_blocking`], from a plain thread).
//!
//! # Stop policy
//!
//! `stop` stops accepting immediately and signals every handler through a
//! shared shutdown channel. Handlers send a close frame and deregister. After
//! `shutdown_timeout` any handler still running is aborted; its drop guard
//! still deregisters it. When `stop` returns the listener is closed and the
//! registry is empty.

use crate::error::{Result, ShareError};
use crate::handler::{HandlerContext, serve_connection};
use crate::listing::{FsDirectory, SharedDirectory};
use crate::protocol::Message;
use crate::registry::{BroadcastReport, SessionRegistry};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// File server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,
    /// Folder whose files are shared
    pub shared_dir: PathBuf,
    /// A send that takes longer than this counts as failed
    pub send_timeout: Duration,
    /// Slowest payload write tolerated, in bytes per second; a file payload
    /// gets `send_timeout` plus its size at this rate
    pub min_transfer_rate: u64,
    /// Largest file served, in bytes
    pub max_file_size: u64,
    /// Largest inbound websocket message, in bytes
    pub max_request_size: usize,
    /// How long `stop` waits for handlers before aborting them
    pub shutdown_timeout: Duration,
    /// Pause after a failed accept
    pub accept_backoff: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
            shared_dir: PathBuf::from(crate::DEFAULT_SHARED_DIR),
            send_timeout: Duration::from_secs(10),
            min_transfer_rate: 1024 * 1024,
            max_file_size: 512 * 1024 * 1024,
            max_request_size: 64 * 1024,
            shutdown_timeout: Duration::from_secs(5),
            accept_backoff: Duration::from_millis(100),
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    directory: Arc<FsDirectory>,
    registry: Arc<SessionRegistry>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Folder-sharing server
#[derive(Clone)]
pub struct FileServer {
    inner: Arc<ServerInner>,
}

impl FileServer {
    /// Create a server for `config`, creating the shared folder if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the shared folder cannot be created.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let directory = FsDirectory::open(&config.shared_dir, config.max_file_size)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                directory: Arc::new(directory),
                registry: Arc::new(SessionRegistry::new()),
                running: AtomicBool::new(false),
                shutdown_tx,
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
            }),
        })
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Shared folder
    pub fn directory(&self) -> &Arc<FsDirectory> {
        &self.inner.directory
    }

    /// Session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Number of connected peers
    pub fn client_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().await
    }

    /// Current listing of the shared folder
    pub async fn listing(&self) -> Result<Vec<String>> {
        self.inner.directory.list_names().await
    }

    /// Bind the listener and start accepting peers
    ///
    /// Returns the bound address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if already running, or `Bind` if the socket
    /// cannot be bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShareError::InvalidState("Server already running".into()));
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        self.inner.shutdown_tx.send_replace(false);
        let shutdown = self.inner.shutdown_tx.subscribe();

        let server = self.clone();
        let task = tokio::spawn(async move {
            server.accept_loop(listener, shutdown).await;
        });

        *self.inner.accept_task.lock().await = Some(task);
        *self.inner.local_addr.lock().await = Some(local_addr);

        info!(
            "Server listening on {} (sharing {})",
            local_addr,
            self.inner.directory.root().display()
        );
        Ok(local_addr)
    }

    /// Stop accepting, close every session and wait for handlers to exit
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the server is not running.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShareError::InvalidState("Server not running".into()));
        }

        self.inner.shutdown_tx.send_replace(true);

        let task = self.inner.accept_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
        *self.inner.local_addr.lock().await = None;

        info!("Server stopped");
        Ok(())
    }

    /// Resolves once `stop` has been requested
    pub async fn stopped(&self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        // Err means the sender is gone, which only happens with the server
        let _ = shutdown.wait_for(|stopping| *stopping).await;
    }

    /// Recompute the listing and broadcast it to every connected peer
    ///
    /// # Errors
    ///
    /// Returns an error if the shared folder cannot be read.
    pub async fn notify_changed(&self) -> Result<BroadcastReport> {
        let files = self.inner.directory.list_names().await?;
        let count = files.len();

        let report = self
            .inner
            .registry
            .broadcast(&Message::Listing { files })
            .await?;

        info!(
            "Broadcast listing ({} files) to {} clients ({} failed)",
            count,
            report.delivered,
            report.failed.len()
        );
        Ok(report)
    }

    /// `notify_changed` for callers outside the runtime (e.g. a UI thread)
    ///
    /// # Errors
    ///
    /// Same as [`FileServer::notify_changed`].
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async context.
    pub fn notify_changed_blocking(
        &self,
        runtime: &tokio::runtime::Handle,
    ) -> Result<BroadcastReport> {
        runtime.block_on(self.notify_changed())
    }

    /// Copy a file into the shared folder and announce the new listing
    ///
    /// Returns the name the file is shared under.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails or the listing cannot be read.
    pub async fn share_file(&self, source: &Path) -> Result<String> {
        let name = self.inner.directory.import(source).await?;
        info!("File added: {}", name);
        self.notify_changed().await?;
        Ok(name)
    }

    async fn bind(&self) -> Result<TcpListener> {
        let addr = self.inner.config.bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|source| ShareError::Bind { addr, source })
    }

    fn handler_context(&self) -> HandlerContext {
        HandlerContext {
            registry: Arc::clone(&self.inner.registry),
            directory: Arc::clone(&self.inner.directory) as Arc<dyn SharedDirectory>,
            send_timeout: self.inner.config.send_timeout,
            min_transfer_rate: self.inner.config.min_transfer_rate,
            max_request_size: self.inner.config.max_request_size,
        }
    }

    async fn accept_loop(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let ctx = self.handler_context();
                        let rx = self.inner.shutdown_tx.subscribe();
                        handlers.spawn(async move {
                            if let Err(e) = serve_connection(stream, peer_addr, ctx, rx).await {
                                debug!("Connection from {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(self.inner.config.accept_backoff).await;
                    }
                },

                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Connection handler failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        self.drain(handlers).await;
    }

    async fn drain(&self, mut handlers: JoinSet<()>) {
        let timeout = self.inner.config.shutdown_timeout;
        let finished = tokio::time::timeout(timeout, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                "{} connection handlers still running after {:?}, aborting",
                handlers.len(),
                timeout
            );
            handlers.abort_all();
            while handlers.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            shared_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8765);
        assert_eq!(config.shared_dir, PathBuf::from("uploads"));
        assert_eq!(config.max_request_size, 64 * 1024);
        assert_eq!(config.min_transfer_rate, 1024 * 1024);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let server = FileServer::new(test_config(&dir)).unwrap();
        assert!(!server.is_running());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert_eq!(server.local_addr().await, Some(addr));

        assert!(matches!(
            server.start().await,
            Err(ShareError::InvalidState(_))
        ));

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert_eq!(server.local_addr().await, None);
        assert!(matches!(server.stop().await, Err(ShareError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let dir = TempDir::new().unwrap();
        let server = FileServer::new(test_config(&dir)).unwrap();

        server.start().await.unwrap();
        server.stop().await.unwrap();
        server.start().await.unwrap();
        assert!(server.is_running());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_resets_state() {
        let dir = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            bind_addr: taken.local_addr().unwrap(),
            ..test_config(&dir)
        };

        let server = FileServer::new(config).unwrap();
        assert!(matches!(server.start().await, Err(ShareError::Bind { .. })));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_notify_without_clients() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let server = FileServer::new(test_config(&dir)).unwrap();

        let report = server.notify_changed().await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(server.listing().await.unwrap(), vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_share_file_copies_into_folder() {
        let src = TempDir::new().unwrap();
        let source = src.path().join("notes.md");
        std::fs::write(&source, b"# notes").unwrap();

        let dir = TempDir::new().unwrap();
        let server = FileServer::new(test_config(&dir)).unwrap();

        let name = server.share_file(&source).await.unwrap();
        assert_eq!(name, "notes.md");
        assert_eq!(std::fs::read(dir.path().join("notes.md")).unwrap(), b"# notes");
    }

    #[test]
    fn test_notify_changed_blocking_from_thread() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let server = FileServer::new(test_config(&dir)).unwrap();

        let handle = runtime.handle().clone();
        let report = std::thread::spawn(move || server.notify_changed_blocking(&handle))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(report.delivered, 0);
    }
}
