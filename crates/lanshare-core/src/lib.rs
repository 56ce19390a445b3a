//! # lanshare Core
//!
//! Connection/session manager and file-transfer protocol for lanshare.
//!
//! One host shares a folder with peers on the local network. Peers hold a
//! persistent websocket connection, receive the folder's file listing as soon
//! as they connect and again whenever the folder changes, and request
//! individual files, which are delivered whole over the same connection.
//!
//! This crate provides:
//! - The wire codec for the three message kinds (`list`, `download`, `file`)
//! - A Listing Store over the shared directory
//! - A concurrency-safe Session Registry with fan-out broadcast
//! - One Connection Handler task per peer
//! - The Server Loop that owns the listening socket
//! - A peer client speaking the same protocol
//!
//! ## Architecture
//!
//! ```text
//!   "file added" ──► FileServer::notify_changed ──► SessionRegistry::broadcast
//!                                                       │
//!        ┌──────────────────────────┬───────────────────┘
//!        ▼                          ▼
//!  ┌────────────┐             ┌────────────┐
//!  │ handler(1) │  ...        │ handler(N) │   one task per peer
//!  └─────┬──────┘             └─────┬──────┘
//!        │ DownloadRequest          │
//!        ▼                          ▼
//!     SharedDirectory (list_names / read)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use lanshare_core::{FileServer, ServerConfig};
//!
//! # async fn example() -> lanshare_core::Result<()> {
//! let config = ServerConfig {
//!     bind_addr: "127.0.0.1:8765".parse().unwrap(),
//!     shared_dir: "uploads".into(),
//!     ..ServerConfig::default()
//! };
//!
//! let server = FileServer::new(config)?;
//! let addr = server.start().await?;
//! println!("serving on ws://{addr}");
//!
//! // A file was copied into the folder by someone else
//! server.notify_changed().await?;
//!
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod listing;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod watcher;

pub use client::PeerClient;
pub use error::{Result, ShareError};
pub use listing::{FsDirectory, SharedDirectory};
pub use protocol::{Message, ProtocolError};
pub use registry::{MessageSink, Session, SessionId, SessionRegistry};
pub use server::{FileServer, ServerConfig};

/// Default listening port
pub const DEFAULT_PORT: u16 = 8765;

/// Default shared directory (relative to the working directory)
pub const DEFAULT_SHARED_DIR: &str = "uploads";
