use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Signals that intents or topology changed and configuration must be rebuilt.
///
/// Signals carry no payload. Any number of signals raised while the receiver is busy collapse
/// into a single pending change, so a burst of watch events causes at most one extra rebuild.
/// Only one task should wait on [`Changes::changed`].
#[derive(Clone, Debug, Default)]
pub struct Changes(Arc<Notify>);

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_one();
    }

    /// Waits until a change has been signaled since the last call returned.
    pub async fn changed(&self) {
        self.0.notified().await
    }
}

/// Records that a watched source has delivered its initial state.
///
/// Passes that run before every source is synced would publish configuration built from a
/// partial view of the cluster.
#[derive(Clone, Debug)]
pub struct Synced(Arc<watch::Sender<bool>>);

// === impl Synced ===

impl Default for Synced {
    fn default() -> Self {
        Self(Arc::new(watch::Sender::new(false)))
    }
}

impl Synced {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.send_if_modified(|synced| !std::mem::replace(synced, true));
    }

    pub fn is_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until the source has been marked synced.
    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        // The sender is owned by `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}
