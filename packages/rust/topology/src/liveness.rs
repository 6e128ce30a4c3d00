//! Heartbeat liveness registry and the stalled-stage monitor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::warn;

/// Shared registry of per-stage heartbeat stamps.
///
/// Stage tasks stamp on every heartbeat tick, independent of message volume;
/// a stage stuck inside `process` stops stamping and is surfaced by the
/// monitor.
#[derive(Clone, Default)]
pub struct Liveness {
    stamps: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat for the stage.
    pub fn touch(&self, stage: &str) {
        self.lock().insert(stage.to_string(), Instant::now());
    }

    /// Stages whose last stamp is older than `threshold`.
    pub fn stale(&self, threshold: Duration) -> Vec<(String, Duration)> {
        let now = Instant::now();
        self.lock()
            .iter()
            .filter_map(|(stage, stamp)| {
                let elapsed = now.duration_since(*stamp);
                (elapsed > threshold).then(|| (stage.clone(), elapsed))
            })
            .collect()
    }

    /// Remove a stage that has shut down; it is no longer expected to beat.
    pub fn remove(&self, stage: &str) {
        self.lock().remove(stage);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.stamps.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Monitor loop: scans the registry on the heartbeat cadence and warns for
/// stages more than three intervals behind. Exits on shutdown signal.
pub(crate) async fn run_monitor(
    liveness: Liveness,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let threshold = interval * 3;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (stage, stalled_for) in liveness.stale(threshold) {
                    warn!(
                        stage = %stage,
                        stalled_for_ms = stalled_for.as_millis() as u64,
                        "stage heartbeat stale"
                    );
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
