//! Connectivity monitor
//!
//! Single source of truth for whether the remote store is reachable. Hosts
//! that know their network state call [`ConnectivityMonitor::set_online`];
//! otherwise [`ConnectivityMonitor::spawn_probe`] pings the remote adapter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::remote::RemoteAdapter;

#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current network state
    ///
    /// Returns whether the state changed. Watchers only see transitions.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    /// Watch for transitions
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Ping `remote` every `interval` and track the result
    ///
    /// The first probe runs immediately. Abort the handle to stop probing.
    pub fn spawn_probe(&self, remote: Arc<dyn RemoteAdapter>, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = match remote.ping().await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Connectivity probe failed: {}", e);
                        false
                    }
                };
                monitor.set_online(reachable);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
