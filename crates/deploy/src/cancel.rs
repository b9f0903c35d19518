//! Cooperative cancellation of a run.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared flag asking a run to stop issuing new calls.
///
/// Clones observe the same signal. The first reason given wins.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request an abort. Returns false if one was already requested.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let fired = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });

        if fired {
            tracing::warn!(%reason, "Abort requested, no new calls will be issued");
        }
        fired
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }
}
