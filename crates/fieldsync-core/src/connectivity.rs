//! Online/offline signal shared by the orchestrator and the UI.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::http::HttpTransport;

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    sender: Arc<watch::Sender<bool>>,
    reconnects: Arc<AtomicU64>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
            reconnects: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Platform hook for OS network notifications. Subscribers are only
    /// woken when the value actually changes.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                if online {
                    self.reconnects.fetch_add(1, Ordering::SeqCst);
                }
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Offline to online transitions so far. Unlike the watch value, this
    /// never collapses a quick offline/online flap into "no change".
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Poll `url` every `interval` and feed the result into [`Self::set_online`].
    /// Any answer from the server counts as online; only a transport failure
    /// counts as offline.
    pub fn spawn_probe<T: HttpTransport>(
        &self,
        transport: Arc<T>,
        url: String,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = match transport.get_json(&url, &[]).await {
                    Ok(_) => true,
                    Err(error) => {
                        tracing::debug!("Probe of {} failed: {}", url, error);
                        !error.is_transport()
                    }
                };
                monitor.set_online(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
