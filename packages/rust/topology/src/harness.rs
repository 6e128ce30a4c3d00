//! Single-stage test harness.
//!
//! Wires one bolt with capture channels on both output streams so stage
//! crates can exercise `process` without standing up a whole topology.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use oerflow_shared::{Material, Result, StreamTag};

use crate::ack::{AckOutcome, AckTracker};
use crate::stage::{Bolt, Delivery, Emitter, StageContext, Supervisor};

const CAPTURE_CAPACITY: usize = 64;

/// Everything one `process` call produced.
#[derive(Debug)]
pub struct HarnessOutput {
    /// Records emitted on the main stream, in emit order.
    pub main: Vec<Material>,
    /// Records emitted on the partial stream, in emit order.
    pub partial: Vec<Material>,
    /// How the record's ack tree resolved.
    pub outcome: AckOutcome,
}

/// Drives one initialized bolt, capturing its emissions and ack behavior.
pub struct StageHarness {
    name: Arc<str>,
    bolt: Box<dyn Bolt>,
    tracker: Arc<AckTracker>,
    supervisor: Supervisor,
    // keeps the intake gate channel open; watch::Sender::send is a no-op
    // once every receiver is dropped
    _gate_rx: watch::Receiver<bool>,
    main_rx: mpsc::Receiver<Delivery>,
    partial_rx: mpsc::Receiver<Delivery>,
}

impl StageHarness {
    /// Initialize `bolt` under `name` with capture consumers bound to both
    /// streams.
    pub async fn init(name: &str, mut bolt: Box<dyn Bolt>) -> Result<Self> {
        let tracker = Arc::new(AckTracker::new());
        let (main_tx, main_rx) = mpsc::channel(CAPTURE_CAPACITY);
        let (partial_tx, partial_rx) = mpsc::channel(CAPTURE_CAPACITY);

        let mut routes = HashMap::new();
        routes.insert(
            StreamTag::Main,
            vec![(Arc::<str>::from("capture-main"), main_tx)],
        );
        routes.insert(
            StreamTag::Partial,
            vec![(Arc::<str>::from("capture-partial"), partial_tx)],
        );

        let name: Arc<str> = Arc::from(name);
        let (supervisor, gate_rx) = Supervisor::new();
        let emitter = Emitter::new(Arc::clone(&name), routes, Arc::clone(&tracker));
        let ctx = StageContext::new(Arc::clone(&name), emitter, supervisor.clone());
        bolt.init(ctx).await?;

        Ok(Self {
            name,
            bolt,
            tracker,
            supervisor,
            _gate_rx: gate_rx,
            main_rx,
            partial_rx,
        })
    }

    /// Supervisor handle, for asserting intake-gate side effects.
    pub fn supervisor(&self) -> Supervisor {
        self.supervisor.clone()
    }

    /// Deliver one record to the bolt and collect everything it produced.
    ///
    /// Captured emissions are success-acked by the harness, so the returned
    /// outcome reflects only the bolt's own ack decision.
    pub async fn process(&mut self, material: Material, stream: StreamTag) -> HarnessOutput {
        let (root, rx_outcome) = self.tracker.open();
        self.tracker.register(root);
        let ack = self.tracker.handle(root, Arc::clone(&self.name));

        self.bolt.process(material, stream, ack).await;
        // release the opener hold now that all emissions are registered
        self.tracker.handle(root, Arc::from("harness")).done();

        let mut main = Vec::new();
        while let Ok(delivery) = self.main_rx.try_recv() {
            main.push(delivery.material);
            delivery.ack.done();
        }
        let mut partial = Vec::new();
        while let Ok(delivery) = self.partial_rx.try_recv() {
            partial.push(delivery.material);
            delivery.ack.done();
        }

        let outcome = rx_outcome.await.unwrap_or(AckOutcome::Failed {
            reason: "ack tracker dropped".into(),
        });

        HarnessOutput {
            main,
            partial,
            outcome,
        }
    }

    /// Run the bolt's `shutdown`.
    pub async fn shutdown(self) -> Result<()> {
        self.bolt.shutdown().await
    }
}

impl HarnessOutput {
    /// The single main-stream emission, if exactly one was produced.
    pub fn sole_main(&self) -> Option<&Material> {
        match self.main.as_slice() {
            [one] => Some(one),
            _ => None,
        }
    }

    /// True when the ack tree resolved successfully.
    pub fn acked(&self) -> bool {
        self.outcome == AckOutcome::Acked
    }
}
