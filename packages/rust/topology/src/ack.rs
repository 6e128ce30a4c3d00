//! Acknowledgment tracking for at-least-once delivery.
//!
//! Every spout message opens a *root* in the [`AckTracker`]. Each delivered
//! copy of the envelope, and each downstream emission anchored to it, holds
//! one registration against the root. The root resolves when the pending
//! count returns to zero; only then is the upstream message acked or failed.
//!
//! The "ack exactly once" rule is enforced structurally: [`AckHandle::done`]
//! and [`AckHandle::fail`] consume the handle, and dropping an unconsumed
//! handle logs a contract violation and resolves as failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Identifier of one spout message's ack tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u64);

/// Final resolution of a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Every stage along the DAG acked the record.
    Acked,
    /// At least one stage failure-acked; carries the first failure reason.
    Failed { reason: String },
}

struct RootEntry {
    pending: usize,
    failure: Option<String>,
    notify: Option<oneshot::Sender<AckOutcome>>,
}

/// Counter-based ack tree shared by all stages of a running topology.
#[derive(Default)]
pub struct AckTracker {
    roots: Mutex<HashMap<u64, RootEntry>>,
    next_id: AtomicU64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a root for a new spout message.
    ///
    /// The root starts with one registration, the opener's own hold, so
    /// the tree cannot resolve while the opener is still emitting. Release
    /// it by consuming the handle returned from [`AckTracker::handle`].
    pub fn open(self: &Arc<Self>) -> (RootId, oneshot::Receiver<AckOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id,
            RootEntry {
                pending: 1,
                failure: None,
                notify: Some(tx),
            },
        );
        (RootId(id), rx)
    }

    /// Register one more in-flight delivery under the root.
    ///
    /// Registrations must happen while the registering stage still holds its
    /// own registration (emit before ack); a registration against an
    /// already-resolved root is tolerated as an orphan and logged.
    pub fn register(&self, root: RootId) {
        let mut roots = self.lock();
        match roots.get_mut(&root.0) {
            Some(entry) => entry.pending += 1,
            None => {
                debug!(root = root.0, "registration against resolved root");
                roots.insert(
                    root.0,
                    RootEntry {
                        pending: 1,
                        failure: None,
                        notify: None,
                    },
                );
            }
        }
    }

    /// Create an ack handle holding one registration of `root`.
    pub fn handle(self: &Arc<Self>, root: RootId, stage: Arc<str>) -> AckHandle {
        AckHandle {
            inner: Some(AckInner {
                root,
                stage,
                tracker: Arc::clone(self),
            }),
        }
    }

    /// Resolve one registration. When the pending count reaches zero the
    /// root completes and its opener is notified.
    fn complete(&self, root: RootId, failure: Option<String>) {
        let mut roots = self.lock();
        let Some(entry) = roots.get_mut(&root.0) else {
            debug!(root = root.0, "completion against resolved root");
            return;
        };
        if let Some(reason) = failure {
            entry.failure.get_or_insert(reason);
        }
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending == 0 {
            let entry = roots.remove(&root.0).expect("entry present");
            if let Some(tx) = entry.notify {
                let outcome = match entry.failure {
                    None => AckOutcome::Acked,
                    Some(reason) => AckOutcome::Failed { reason },
                };
                let _ = tx.send(outcome);
            }
        }
    }

    /// Number of unresolved roots (spout messages awaiting full-DAG ack).
    pub fn open_roots(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, RootEntry>> {
        self.roots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct AckInner {
    root: RootId,
    stage: Arc<str>,
    tracker: Arc<AckTracker>,
}

/// Owned, single-use acknowledgment token for one delivered record.
pub struct AckHandle {
    inner: Option<AckInner>,
}

impl AckHandle {
    /// The root this record is anchored to, for emitting derived records.
    pub fn root(&self) -> RootId {
        self.inner
            .as_ref()
            .map(|i| i.root)
            .expect("ack handle already consumed")
    }

    /// Acknowledge successful processing.
    pub fn done(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.tracker.complete(inner.root, None);
        }
    }

    /// Acknowledge failed processing; the root resolves as failed and the
    /// source message becomes eligible for redelivery.
    pub fn fail(mut self, reason: impl Into<String>) {
        if let Some(inner) = self.inner.take() {
            let reason = reason.into();
            debug!(stage = %inner.stage, reason = %reason, "failure-ack");
            inner.tracker.complete(inner.root, Some(reason));
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            warn!(
                stage = %inner.stage,
                "record dropped without ack (stage contract violation), resolving as failure"
            );
            inner
                .tracker
                .complete(inner.root, Some("dropped without ack".into()));
        }
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("consumed", &self.inner.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str) -> Arc<str> {
        Arc::from(name)
    }

    #[tokio::test]
    async fn root_resolves_after_all_acks() {
        let tracker = Arc::new(AckTracker::new());
        let (root, rx) = tracker.open();

        // two deliveries plus the opener's hold
        tracker.register(root);
        tracker.register(root);
        let a = tracker.handle(root, stage("a"));
        let b = tracker.handle(root, stage("b"));
        let opener = tracker.handle(root, stage("spout"));

        opener.done();
        a.done();
        b.done();

        assert_eq!(rx.await.expect("outcome"), AckOutcome::Acked);
        assert_eq!(tracker.open_roots(), 0);
    }

    #[tokio::test]
    async fn first_failure_reason_wins() {
        let tracker = Arc::new(AckTracker::new());
        let (root, rx) = tracker.open();

        tracker.register(root);
        tracker.register(root);
        let a = tracker.handle(root, stage("a"));
        let b = tracker.handle(root, stage("b"));
        tracker.handle(root, stage("spout")).done();

        a.fail("sink unavailable");
        b.fail("second failure");

        assert_eq!(
            rx.await.expect("outcome"),
            AckOutcome::Failed {
                reason: "sink unavailable".into()
            }
        );
    }

    #[tokio::test]
    async fn dropped_handle_resolves_as_failure() {
        let tracker = Arc::new(AckTracker::new());
        let (root, rx) = tracker.open();

        tracker.register(root);
        let handle = tracker.handle(root, stage("leaky"));
        tracker.handle(root, stage("spout")).done();

        drop(handle);

        match rx.await.expect("outcome") {
            AckOutcome::Failed { reason } => assert!(reason.contains("dropped without ack")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn opener_hold_prevents_early_resolution() {
        let tracker = Arc::new(AckTracker::new());
        let (root, mut rx) = tracker.open();

        // first delivery registered and acked while the opener still emits
        tracker.register(root);
        tracker.handle(root, stage("a")).done();
        assert!(rx.try_recv().is_err(), "root must not resolve early");

        tracker.register(root);
        tracker.handle(root, stage("b")).done();
        tracker.handle(root, stage("spout")).done();
        assert_eq!(rx.await.expect("outcome"), AckOutcome::Acked);
    }
}
