//! Connectivity Signal
//!
//! An observable online/offline flag fed by the platform layer (reachability
//! callbacks on mobile, network change events on desktop). The sync
//! coordinator subscribes to the watch channel and never polls an OS API.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared online/offline state with watch-based subscriptions
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// Feed a connectivity change from the platform layer. Repeated reports
    /// of the same state do not wake subscribers.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
        if changed {
            log::info!(
                "connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
