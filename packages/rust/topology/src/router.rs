//! Runtime topology router and scheduler.
//!
//! [`run`] resolves a validated [`TopologySpec`] plus stage instances into a
//! running fan-in/fan-out graph: one bounded mpsc channel per bolt (the
//! backpressure window), one tokio task per stage, a shared ack tree, a
//! heartbeat monitor, and a coordinated bounded-time shutdown path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{info, warn};
use url::Url;

use oerflow_shared::{Material, PipelineError, Result, StreamTag};
use oerflow_shared::config::PipelineConfig;

use crate::ack::{AckOutcome, AckTracker};
use crate::liveness::{Liveness, run_monitor};
use crate::spec::TopologySpec;
use crate::stage::{Bolt, Delivery, Emitter, Source, SourceMessage, StageContext, Supervisor};

// ---------------------------------------------------------------------------
// RuntimeOptions
// ---------------------------------------------------------------------------

/// Scheduler knobs, captured once at startup.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Heartbeat interval for every stage and the monitor.
    pub heartbeat: Duration,
    /// Bounded channel capacity between a producer and each consumer.
    pub backpressure_window: usize,
    /// Concurrent `process` calls within one stage instance.
    pub stage_fan_out: usize,
    /// Max spout messages awaiting full-DAG acknowledgment.
    pub max_pending: usize,
    /// Bounded teardown wait.
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for RuntimeOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            heartbeat: Duration::from_millis(config.heartbeat_ms),
            backpressure_window: config.backpressure_window.max(1),
            stage_fan_out: config.stage_fan_out.max(1),
            max_pending: config.max_pending.max(1),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Per-stage accounting returned by its task.
#[derive(Debug)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Records processed (bolts) or messages pulled (spouts).
    pub processed: u64,
    /// Error from the stage's `shutdown`, if any.
    pub shutdown_error: Option<String>,
}

/// Aggregated teardown outcome. Errors are reported, never re-raised:
/// shutdown always completes within the bounded timeout.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Stages that drained and shut down cleanly.
    pub completed: Vec<String>,
    /// Stages aborted at the deadline; their in-flight records were dropped.
    pub aborted: Vec<String>,
    /// (stage, error) pairs collected during teardown.
    pub errors: Vec<(String, String)>,
    /// Total records processed across all stages.
    pub processed: u64,
}

// ---------------------------------------------------------------------------
// Topology startup
// ---------------------------------------------------------------------------

/// Start a topology: validate the spec, wire channels, initialize every
/// stage, and spawn the stage tasks.
///
/// `bolts` and `sources` are keyed by stage name. Any stage initialization
/// failure aborts startup with an error naming the stage; already-started
/// stages get a best-effort `shutdown`.
pub async fn run(
    spec: TopologySpec,
    mut bolts: HashMap<String, Box<dyn Bolt>>,
    mut sources: HashMap<String, Box<dyn Source>>,
    opts: RuntimeOptions,
) -> Result<TopologyHandle> {
    spec.validate()?;

    // One bounded input channel per bolt.
    let mut txs: HashMap<String, mpsc::Sender<Delivery>> = HashMap::new();
    let mut rxs: HashMap<String, mpsc::Receiver<Delivery>> = HashMap::new();
    for bolt in &spec.bolts {
        let (tx, rx) = mpsc::channel(opts.backpressure_window);
        txs.insert(bolt.name.clone(), tx);
        rxs.insert(bolt.name.clone(), rx);
    }

    // producer name → (stream → bound consumers).
    let mut routes: HashMap<String, HashMap<StreamTag, Vec<(Arc<str>, mpsc::Sender<Delivery>)>>> =
        HashMap::new();
    for bolt in &spec.bolts {
        let tx = txs[&bolt.name].clone();
        for binding in &bolt.inputs {
            routes
                .entry(binding.source.clone())
                .or_default()
                .entry(binding.stream)
                .or_default()
                .push((Arc::from(bolt.name.as_str()), tx.clone()));
        }
    }
    // Senders now live only inside emitters, so channels close when their
    // producers finish.
    drop(txs);

    let tracker = Arc::new(AckTracker::new());
    let (supervisor, gate_rx) = Supervisor::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let liveness = Liveness::new();

    // Initialize bolts before any record flows.
    let mut ready: Vec<(Arc<str>, Arc<dyn Bolt>)> = Vec::new();
    for bolt_spec in &spec.bolts {
        let mut bolt = bolts.remove(&bolt_spec.name).ok_or_else(|| {
            PipelineError::topology(format!(
                "no bolt instance supplied for stage '{}'",
                bolt_spec.name
            ))
        })?;
        let name: Arc<str> = Arc::from(bolt_spec.name.as_str());
        let emitter = Emitter::new(
            Arc::clone(&name),
            routes.remove(&bolt_spec.name).unwrap_or_default(),
            Arc::clone(&tracker),
        );
        let ctx = StageContext::new(Arc::clone(&name), emitter, supervisor.clone());
        if let Err(e) = bolt.init(ctx).await {
            abort_startup(&ready).await;
            return Err(PipelineError::topology(format!(
                "stage '{}' failed to initialize: {e}",
                bolt_spec.name
            )));
        }
        ready.push((name, Arc::from(bolt)));
    }

    // Initialize sources.
    let mut spouts_ready: Vec<(Arc<str>, Box<dyn Source>, Emitter)> = Vec::new();
    for spout_spec in &spec.spouts {
        let mut source = sources.remove(&spout_spec.name).ok_or_else(|| {
            PipelineError::topology(format!(
                "no source instance supplied for spout '{}'",
                spout_spec.name
            ))
        })?;
        let name: Arc<str> = Arc::from(spout_spec.name.as_str());
        if let Err(e) = source.init(&name).await {
            abort_startup(&ready).await;
            return Err(PipelineError::topology(format!(
                "stage '{}' failed to initialize: {e}",
                spout_spec.name
            )));
        }
        let emitter = Emitter::new(
            Arc::clone(&name),
            routes.remove(&spout_spec.name).unwrap_or_default(),
            Arc::clone(&tracker),
        );
        spouts_ready.push((name, source, emitter));
    }
    drop(routes);

    // Spawn stage tasks.
    let mut stage_tasks: Vec<(String, JoinHandle<StageReport>)> = Vec::new();
    for (name, bolt) in ready {
        let rx = rxs.remove(&*name).expect("receiver wired for every bolt");
        liveness.touch(&name);
        stage_tasks.push((
            name.to_string(),
            tokio::spawn(run_bolt(
                name,
                bolt,
                rx,
                opts.stage_fan_out,
                opts.heartbeat,
                liveness.clone(),
            )),
        ));
    }
    for (name, source, emitter) in spouts_ready {
        liveness.touch(&name);
        stage_tasks.push((
            name.to_string(),
            tokio::spawn(run_spout(
                name,
                source,
                emitter,
                Arc::clone(&tracker),
                opts.max_pending,
                opts.heartbeat,
                shutdown_rx.clone(),
                gate_rx.clone(),
                liveness.clone(),
            )),
        ));
    }

    let monitor = tokio::spawn(run_monitor(
        liveness.clone(),
        opts.heartbeat,
        shutdown_rx.clone(),
    ));

    info!(
        topology = %spec.name,
        spouts = spec.spouts.len(),
        bolts = spec.bolts.len(),
        "topology started"
    );

    Ok(TopologyHandle {
        name: spec.name,
        shutdown_tx,
        supervisor,
        stage_tasks,
        monitor,
        shutdown_timeout: opts.shutdown_timeout,
    })
}

/// Best-effort teardown of stages that initialized before a later stage's
/// init failure aborted startup.
async fn abort_startup(ready: &[(Arc<str>, Arc<dyn Bolt>)]) {
    for (name, bolt) in ready {
        if let Err(e) = bolt.shutdown().await {
            warn!(stage = %name, error = %e, "shutdown during aborted startup failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Bolt task
// ---------------------------------------------------------------------------

enum BoltEvent {
    Delivery(Option<Delivery>),
    Tick,
    Reaped(std::result::Result<(), tokio::task::JoinError>),
}

async fn run_bolt(
    name: Arc<str>,
    bolt: Arc<dyn Bolt>,
    mut rx: mpsc::Receiver<Delivery>,
    fan_out: usize,
    heartbeat: Duration,
    liveness: Liveness,
) -> StageReport {
    let semaphore = Arc::new(Semaphore::new(fan_out));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut processed: u64 = 0;

    loop {
        let event = tokio::select! {
            maybe = rx.recv() => BoltEvent::Delivery(maybe),
            _ = ticker.tick() => BoltEvent::Tick,
            Some(res) = tasks.join_next(), if !tasks.is_empty() => BoltEvent::Reaped(res),
        };

        match event {
            BoltEvent::Delivery(Some(delivery)) => {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore closed");
                processed += 1;
                let bolt = Arc::clone(&bolt);
                tasks.spawn(async move {
                    let _permit = permit;
                    let Delivery {
                        material,
                        stream,
                        ack,
                    } = delivery;
                    bolt.process(material, stream, ack).await;
                });
            }
            // All producers finished and the backlog is drained.
            BoltEvent::Delivery(None) => break,
            BoltEvent::Tick => {
                bolt.heartbeat();
                liveness.touch(&name);
            }
            // A panicking process call drops its AckHandle, so the record is
            // already failure-acked; the panic itself still gets surfaced.
            BoltEvent::Reaped(Err(e)) => {
                warn!(stage = %name, error = %e, "process task failed");
            }
            BoltEvent::Reaped(Ok(())) => {}
        }
    }

    // Drain outstanding process calls before releasing resources.
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            warn!(stage = %name, error = %e, "process task failed");
        }
    }

    let shutdown_error = bolt.shutdown().await.err().map(|e| e.to_string());
    liveness.remove(&name);
    info!(stage = %name, processed, "stage drained and shut down");

    StageReport {
        name: name.to_string(),
        processed,
        shutdown_error,
    }
}

// ---------------------------------------------------------------------------
// Spout task
// ---------------------------------------------------------------------------

enum SpoutEvent {
    Tick,
    ShutdownChanged,
    Resolved(Option<std::result::Result<(String, AckOutcome), tokio::task::JoinError>>),
    Message(Result<Option<SourceMessage>>),
}

#[allow(clippy::too_many_arguments)]
async fn run_spout(
    name: Arc<str>,
    mut source: Box<dyn Source>,
    emitter: Emitter,
    tracker: Arc<AckTracker>,
    max_pending: usize,
    heartbeat: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut gate_rx: watch::Receiver<bool>,
    liveness: Liveness,
) -> StageReport {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: JoinSet<(String, AckOutcome)> = JoinSet::new();
    let mut pulled: u64 = 0;

    'intake: loop {
        if *shutdown_rx.borrow() {
            break 'intake;
        }

        // Supervisor gate: a halted dependency pauses intake, not drain.
        while !*gate_rx.borrow() {
            tokio::select! {
                changed = gate_rx.changed() => {
                    if changed.is_err() {
                        break 'intake;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break 'intake;
                    }
                }
                _ = ticker.tick() => liveness.touch(&name),
            }
        }

        // Cap in-flight roots.
        while pending.len() >= max_pending {
            match pending.join_next().await {
                Some(Ok((id, outcome))) => resolve_outcome(source.as_mut(), &id, outcome).await,
                Some(Err(e)) => warn!(stage = %name, error = %e, "pending-ack task failed"),
                None => break,
            }
        }

        let event = tokio::select! {
            _ = ticker.tick() => SpoutEvent::Tick,
            _ = shutdown_rx.changed() => SpoutEvent::ShutdownChanged,
            res = pending.join_next(), if !pending.is_empty() => SpoutEvent::Resolved(res),
            next = source.next() => SpoutEvent::Message(next),
        };

        match event {
            SpoutEvent::Tick => liveness.touch(&name),
            SpoutEvent::ShutdownChanged => {}
            SpoutEvent::Resolved(Some(Ok((id, outcome)))) => {
                resolve_outcome(source.as_mut(), &id, outcome).await;
            }
            SpoutEvent::Resolved(Some(Err(e))) => {
                warn!(stage = %name, error = %e, "pending-ack task failed");
            }
            SpoutEvent::Resolved(None) => {}
            SpoutEvent::Message(Ok(Some(message))) => {
                pulled += 1;
                dispatch_message(&name, &emitter, &tracker, &mut pending, message).await;
            }
            SpoutEvent::Message(Ok(None)) => {
                info!(stage = %name, pulled, "source exhausted");
                break 'intake;
            }
            SpoutEvent::Message(Err(e)) => {
                warn!(stage = %name, error = %e, "source error, backing off");
                tokio::time::sleep(heartbeat).await;
            }
        }
    }

    // Drain outstanding roots so every admitted record is acked or failed
    // back to the source. The coordinator enforces the bounded deadline.
    while let Some(res) = pending.join_next().await {
        match res {
            Ok((id, outcome)) => resolve_outcome(source.as_mut(), &id, outcome).await,
            Err(e) => warn!(stage = %name, error = %e, "pending-ack task failed"),
        }
    }

    let shutdown_error = source.shutdown().await.err().map(|e| e.to_string());
    liveness.remove(&name);
    info!(stage = %name, pulled, "spout drained and shut down");

    StageReport {
        name: name.to_string(),
        processed: pulled,
        shutdown_error,
    }
}

/// Turn a source message into an envelope, emit it into the DAG, and track
/// the root outcome. A malformed material URL fails the message immediately.
async fn dispatch_message(
    name: &Arc<str>,
    emitter: &Emitter,
    tracker: &Arc<AckTracker>,
    pending: &mut JoinSet<(String, AckOutcome)>,
    message: SourceMessage,
) {
    let SourceMessage { id, descriptor } = message;

    let url = match Url::parse(&descriptor.material_url) {
        Ok(url) => url,
        Err(e) => {
            warn!(
                stage = %name,
                msg_id = %id,
                material_url = %descriptor.material_url,
                error = %e,
                "malformed material URL, failing message"
            );
            let reason = format!("malformed material URL: {e}");
            pending.spawn(async move { (id, AckOutcome::Failed { reason }) });
            return;
        }
    };

    let mut material = Material::new(url, descriptor);
    material.record_stage(name);

    let (root, rx_outcome) = tracker.open();
    let hold = tracker.handle(root, Arc::clone(name));
    emitter.emit(StreamTag::Main, material, &hold).await;
    hold.done();

    pending.spawn(async move {
        let outcome = rx_outcome.await.unwrap_or(AckOutcome::Failed {
            reason: "ack tracker dropped".into(),
        });
        (id, outcome)
    });
}

async fn resolve_outcome(source: &mut dyn Source, id: &str, outcome: AckOutcome) {
    match outcome {
        AckOutcome::Acked => {
            if let Err(e) = source.ack(id).await {
                warn!(msg_id = %id, error = %e, "source ack failed");
            }
        }
        AckOutcome::Failed { reason } => {
            warn!(msg_id = %id, reason = %reason, "record failed, returning message for redelivery");
            if let Err(e) = source.fail(id).await {
                warn!(msg_id = %id, error = %e, "source fail-ack failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TopologyHandle
// ---------------------------------------------------------------------------

/// Handle to a running topology: shutdown coordination and final reports.
pub struct TopologyHandle {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Supervisor,
    stage_tasks: Vec<(String, JoinHandle<StageReport>)>,
    monitor: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl TopologyHandle {
    /// Supervisor handle, for external intake control.
    pub fn supervisor(&self) -> Supervisor {
        self.supervisor.clone()
    }

    /// Clone of the shutdown signal, so an external task (e.g. a ctrl-c
    /// handler) can request drain while another waits on [`Self::join`].
    pub fn shutdown_signal(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Wait for natural completion (every source exhausted and every record
    /// drained). Intended for finite sources.
    pub async fn join(self) -> ShutdownReport {
        self.finish(None).await
    }

    /// Signal all stages to stop accepting input, wait for in-flight acks to
    /// drain up to the configured timeout, then abort stragglers.
    pub async fn shutdown(self) -> ShutdownReport {
        info!(topology = %self.name, "shutdown signaled");
        let _ = self.shutdown_tx.send(true);
        let deadline = self.shutdown_timeout;
        self.finish(Some(deadline)).await
    }

    async fn finish(mut self, limit: Option<Duration>) -> ShutdownReport {
        let deadline = limit.map(|d| Instant::now() + d);
        let mut report = ShutdownReport::default();

        for (stage, mut task) in self.stage_tasks.drain(..) {
            let joined = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match timeout(remaining, &mut task).await {
                        Ok(res) => res,
                        Err(_) => {
                            warn!(
                                stage = %stage,
                                "stage missed shutdown deadline, aborting; in-flight records dropped"
                            );
                            task.abort();
                            report.aborted.push(stage);
                            continue;
                        }
                    }
                }
                None => (&mut task).await,
            };

            match joined {
                Ok(stage_report) => {
                    report.processed += stage_report.processed;
                    if let Some(err) = stage_report.shutdown_error {
                        report.errors.push((stage.clone(), err));
                    }
                    report.completed.push(stage);
                }
                Err(e) => {
                    report
                        .errors
                        .push((stage, format!("stage task panicked: {e}")));
                }
            }
        }

        // Stop the monitor (covers the natural-completion path too).
        let _ = self.shutdown_tx.send(true);
        self.monitor.abort();

        if report.errors.is_empty() && report.aborted.is_empty() {
            info!(topology = %self.name, processed = report.processed, "topology stopped cleanly");
        } else {
            warn!(
                topology = %self.name,
                aborted = ?report.aborted,
                errors = ?report.errors,
                "topology stopped with issues"
            );
        }
        report
    }
}
