//! User-facing sync notices (toasts, banners) published by the engine.

use tokio::sync::broadcast;

const NOTICE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// A submission was stored offline.
    Queued { domain: String, pending: usize },
    /// A dispatch run delivered entries.
    Delivered { domain: String, count: usize },
    /// The server answered but refused the entry; it stays queued.
    Rejected {
        domain: String,
        id_local: String,
        message: String,
    },
    /// No response from the server; the entry stays queued.
    ConnectionFailed {
        domain: String,
        id_local: String,
        error: String,
    },
    /// Entries moved out of the live queue for operator review.
    DeadLettered { domain: String, count: usize },
    /// A live fetch failed and the last cached value was returned.
    ServedFromCache { cache_key: String, error: String },
    /// The change summary could not be fetched; local data is shown.
    SummaryUnavailable { resource: String, error: String },
}

/// Fan-out of notices. Sending never blocks and never fails the engine,
/// even with no subscribers.
#[derive(Debug, Clone)]
pub struct NoticeSender {
    sender: broadcast::Sender<SyncNotice>,
}

impl Default for NoticeSender {
    fn default() -> Self {
        Self::new()
    }
}

impl NoticeSender {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.sender.subscribe()
    }

    pub fn publish(&self, notice: SyncNotice) {
        // Err only means nobody is listening.
        let _ = self.sender.send(notice);
    }
}
