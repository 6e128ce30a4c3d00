//! The stage lifecycle contract shared by every spout and bolt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use oerflow_shared::{Material, RawDescriptor, Result, StreamTag};

use crate::ack::{AckHandle, AckTracker, RootId};

// ---------------------------------------------------------------------------
// Bolt
// ---------------------------------------------------------------------------

/// A discrete transformation stage.
///
/// Lifecycle: `init` runs to completion before any record is delivered and
/// its failure aborts topology startup; `process` is invoked once per
/// delivered record and must consume its [`AckHandle`] exactly once;
/// `shutdown` runs after the stage's input channel has drained.
#[async_trait]
pub trait Bolt: Send + Sync {
    /// Allocate stage resources. The context carries the stage name, the
    /// emitter for downstream streams, and the supervisor handle.
    async fn init(&mut self, ctx: StageContext) -> Result<()>;

    /// Non-blocking periodic liveness probe. Carries no processing
    /// semantics.
    fn heartbeat(&self) {}

    /// Core transform. May emit zero or more derived records through the
    /// emitter captured at init; must consume `ack` exactly once, after all
    /// emissions for this record.
    async fn process(&self, material: Material, stream: StreamTag, ack: AckHandle);

    /// Release held resources. Teardown blocks on this up to a bounded
    /// timeout.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Source (spout)
// ---------------------------------------------------------------------------

/// One message pulled from the upstream queue.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    /// Queue-side identifier, echoed back on ack/fail.
    pub id: String,
    /// The raw material descriptor.
    pub descriptor: RawDescriptor,
}

/// An external message source feeding a spout.
///
/// Messages are acknowledged only after the emitted envelope has been acked
/// through the entire DAG (at-least-once semantics).
#[async_trait]
pub trait Source: Send {
    /// Open connections to the upstream queue. Failure aborts startup.
    async fn init(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Pull the next message. `Ok(None)` means the source is exhausted and
    /// the spout may complete naturally.
    async fn next(&mut self) -> Result<Option<SourceMessage>>;

    /// The message's envelope was acked through the whole DAG.
    async fn ack(&mut self, msg_id: &str) -> Result<()>;

    /// Processing failed somewhere; the message is eligible for redelivery.
    async fn fail(&mut self, msg_id: &str) -> Result<()>;

    /// Release upstream resources.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StageContext
// ---------------------------------------------------------------------------

/// Everything a stage receives at `init` time. No ambient configuration is
/// threaded through stages beyond this.
#[derive(Clone)]
pub struct StageContext {
    name: Arc<str>,
    emitter: Emitter,
    supervisor: Supervisor,
}

impl StageContext {
    pub(crate) fn new(name: Arc<str>, emitter: Emitter, supervisor: Supervisor) -> Self {
        Self {
            name,
            emitter,
            supervisor,
        }
    }

    /// The stage's declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emitter for this stage's output streams.
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    /// Supervisor handle for reporting unrecoverable stage-level errors.
    pub fn supervisor(&self) -> Supervisor {
        self.supervisor.clone()
    }
}

// ---------------------------------------------------------------------------
// Delivery & Emitter
// ---------------------------------------------------------------------------

/// One record in flight toward a consumer.
pub struct Delivery {
    pub material: Material,
    pub stream: StreamTag,
    pub ack: AckHandle,
}

/// Dispatches emitted records to every consumer bound to a stream.
///
/// Each bound consumer receives an independent clone of the envelope, so one
/// consumer's downstream mutation is never observable by another. Emission
/// order toward a given consumer on a given stream is the emit call order;
/// a full backpressure window suspends the emitting stage until acks free
/// capacity.
#[derive(Clone)]
pub struct Emitter {
    stage: Arc<str>,
    routes: Arc<HashMap<StreamTag, Vec<(Arc<str>, mpsc::Sender<Delivery>)>>>,
    tracker: Arc<AckTracker>,
}

impl Emitter {
    pub(crate) fn new(
        stage: Arc<str>,
        routes: HashMap<StreamTag, Vec<(Arc<str>, mpsc::Sender<Delivery>)>>,
        tracker: Arc<AckTracker>,
    ) -> Self {
        Self {
            stage,
            routes: Arc::new(routes),
            tracker,
        }
    }

    /// Emit a record on the given stream, anchored to the record being
    /// processed. Must be called before the anchor is consumed.
    ///
    /// A stream with no bound consumer drops the emission with a debug log;
    /// minimal topologies may leave the partial stream unbound.
    pub async fn emit(&self, stream: StreamTag, material: Material, anchor: &AckHandle) {
        self.emit_root(stream, material, anchor.root()).await;
    }

    pub(crate) async fn emit_root(&self, stream: StreamTag, material: Material, root: RootId) {
        let Some(consumers) = self.routes.get(&stream) else {
            debug!(stage = %self.stage, %stream, "no consumer bound, dropping emission");
            return;
        };

        for (consumer, tx) in consumers {
            self.tracker.register(root);
            let ack = self.tracker.handle(root, Arc::clone(consumer));
            let delivery = Delivery {
                material: material.clone(),
                stream,
                ack,
            };
            if let Err(rejected) = tx.send(delivery).await {
                warn!(
                    stage = %self.stage,
                    consumer = %consumer,
                    url = %rejected.0.material.material_url(),
                    "consumer channel closed, dropping record"
                );
                rejected.0.ack.fail("consumer channel closed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Intake gate for unrecoverable stage-level errors.
///
/// A stage whose dependency is permanently unavailable reports here; the
/// spouts stop pulling new messages until the stage reports recovery.
#[derive(Clone)]
pub struct Supervisor {
    gate: Arc<watch::Sender<bool>>,
}

impl Supervisor {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(true);
        (Self { gate: Arc::new(tx) }, rx)
    }

    /// Halt spout intake. Records already in flight keep draining.
    pub fn halt_intake(&self, stage: &str, reason: &str) {
        if *self.gate.borrow() {
            error!(stage, reason, "stage unavailable, halting spout intake");
            let _ = self.gate.send(false);
        }
    }

    /// Reopen spout intake after the stage recovered.
    pub fn resume_intake(&self, stage: &str) {
        if !*self.gate.borrow() {
            info!(stage, "stage recovered, resuming spout intake");
            let _ = self.gate.send(true);
        }
    }

    /// Whether spouts are currently allowed to pull new messages.
    pub fn intake_open(&self) -> bool {
        *self.gate.borrow()
    }
}
