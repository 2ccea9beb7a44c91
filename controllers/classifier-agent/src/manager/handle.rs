//! Watch handles and registry entries.

use chrono::{DateTime, Utc};
use cluster_client::ResourceKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Stops one watch subscription.
///
/// Clones refer to the same subscription. Cancelling more than once is a
/// no-op.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    id: Uuid,
    token: CancellationToken,
}

impl WatchHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
        }
    }

    /// Identifier of the subscription this handle controls
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stops the subscription's background task.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once the subscription was asked to stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl PartialEq for WatchHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WatchHandle {}

/// Registry entry; exists only while the subscription is open.
#[derive(Debug)]
pub(crate) struct WatchEntry {
    pub kind: ResourceKind,
    pub handle: WatchHandle,
    pub started_at: DateTime<Utc>,
    pub task: JoinHandle<()>,
}

impl WatchEntry {
    /// Cancels the subscription and waits for its task to finish.
    pub async fn stop(self) {
        self.handle.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Watch task for {} did not exit cleanly: {}", self.kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_twice_is_noop() {
        let handle = WatchHandle::new(CancellationToken::new());
        assert!(!handle.is_cancelled());

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_clones_share_identity() {
        let handle = WatchHandle::new(CancellationToken::new());
        let clone = handle.clone();
        assert_eq!(handle, clone);

        clone.cancel();
        assert!(handle.is_cancelled());

        let other = WatchHandle::new(CancellationToken::new());
        assert_ne!(handle, other);
    }
}
