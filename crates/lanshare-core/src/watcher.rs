//! Directory change notifier.
//!
//! Polls the shared folder and calls [`FileServer::notify_changed`] whenever
//! its set of names differs from the previous poll. Catches files copied into
//! the folder by other processes; in-process additions should go through
//! [`FileServer::share_file`], which notifies immediately.

use crate::server::FileServer;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Remembers the last listing seen and reports changes
#[derive(Debug, Default)]
pub struct ListingTracker {
    last: Option<Vec<String>>,
}

impl ListingTracker {
    /// Create a tracker primed with `initial`
    pub fn new(initial: Vec<String>) -> Self {
        Self {
            last: Some(initial),
        }
    }

    /// Record `names`; returns `true` if they differ from the previous call
    pub fn observe(&mut self, names: Vec<String>) -> bool {
        if self.last.as_ref() == Some(&names) {
            return false;
        }
        self.last = Some(names);
        true
    }
}

/// Poll the server's folder every `interval` until the server stops
pub fn spawn_directory_watcher(server: FileServer, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = match server.listing().await {
            Ok(names) => ListingTracker::new(names),
            Err(e) => {
                warn!("Initial listing failed: {}", e);
                ListingTracker::default()
            }
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stopped = server.stopped();
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {}
            }

            let names = match server.listing().await {
                Ok(names) => names,
                Err(e) => {
                    warn!("Failed to read shared folder: {}", e);
                    continue;
                }
            };

            if tracker.observe(names) {
                debug!("Shared folder changed");
                if let Err(e) = server.notify_changed().await {
                    warn!("Failed to broadcast listing: {}", e);
                }
            }
        }

        debug!("Directory watcher stopped");
    })
}
