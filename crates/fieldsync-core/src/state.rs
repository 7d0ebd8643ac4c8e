//! Per-domain sync state shown next to each form's pending badge.

/// Derived from connectivity, the dispatch guard and the pending count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// A dispatch run for the domain is in flight.
    Syncing,
    /// Entries are waiting and the device is offline.
    Offline,
    /// Entries are waiting and the device is online.
    Pending,
    /// Nothing left to send.
    Synced,
}

impl SyncState {
    pub const fn derive(online: bool, dispatching: bool, pending: usize) -> Self {
        if dispatching {
            Self::Syncing
        } else if pending == 0 {
            Self::Synced
        } else if online {
            Self::Pending
        } else {
            Self::Offline
        }
    }
}
