//! Approval gating for tools
//!
//! Approval-class tools suspend until an RPC client resolves the pending
//! approval out-of-band. Each request is a typed oneshot keyed by approval
//! id; dropping the connection cancels everything it left pending.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

/// How a pending approval was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResolution {
    Approved,
    Denied,
    /// No client answered in time
    TimedOut,
}

/// Broker for pending tool approvals
#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<ApprovalResolution>>>,
}

impl ApprovalBroker {
    /// Empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new approval and wait for its resolution, up to `timeout`.
    pub async fn request(&self, approval_id: Uuid, timeout: Duration) -> ApprovalResolution {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut guard) = self.pending.lock() {
            guard.insert(approval_id, tx);
        }

        let resolution = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resolution)) => resolution,
            // Sender dropped (cancel_all) counts as denial
            Ok(Err(_)) => ApprovalResolution::Denied,
            Err(_) => ApprovalResolution::TimedOut,
        };

        if let Ok(mut guard) = self.pending.lock() {
            guard.remove(&approval_id);
        }
        resolution
    }

    /// Resolve a pending approval. Returns false for unknown ids (late or
    /// duplicate resolutions).
    pub fn resolve(&self, approval_id: Uuid, approved: bool) -> bool {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut guard| guard.remove(&approval_id));
        match sender {
            Some(tx) => {
                let resolution = if approved {
                    ApprovalResolution::Approved
                } else {
                    ApprovalResolution::Denied
                };
                tx.send(resolution).is_ok()
            }
            None => false,
        }
    }

    /// Ids currently awaiting resolution
    #[must_use]
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.pending
            .lock()
            .map(|guard| guard.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Deny everything outstanding (connection teardown)
    pub fn cancel_all(&self) {
        if let Ok(mut guard) = self.pending.lock() {
            for (_, tx) in guard.drain() {
                let _ = tx.send(ApprovalResolution::Denied);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn approve_resolves_waiter() {
        let broker = ApprovalBroker::new();
        let id = Uuid::new_v4();
        let wait = broker.request(id, Duration::from_secs(5));
        tokio::pin!(wait);

        // Let the request register before resolving
        tokio::select! {
            _ = &mut wait => panic!("resolved early"),
            () = tokio::task::yield_now() => {}
        }

        assert!(broker.resolve(id, true));
        assert_eq!(wait.await, ApprovalResolution::Approved);
    }

    #[tokio::test]
    async fn timeout_yields_timed_out() {
        let broker = ApprovalBroker::new();
        let resolution = broker
            .request(Uuid::new_v4(), Duration::from_millis(10))
            .await;
        assert_eq!(resolution, ApprovalResolution::TimedOut);
    }

    #[tokio::test]
    async fn unknown_id_resolution_is_rejected() {
        let broker = ApprovalBroker::new();
        assert!(!broker.resolve(Uuid::new_v4(), true));
    }

    #[tokio::test]
    async fn cancel_all_denies_pending() {
        let broker = std::sync::Arc::new(ApprovalBroker::new());
        let id = Uuid::new_v4();
        let waiter = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move { broker.request(id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        broker.cancel_all();
        assert_eq!(waiter.await.unwrap(), ApprovalResolution::Denied);
        assert!(broker.pending_ids().is_empty());
    }
}
