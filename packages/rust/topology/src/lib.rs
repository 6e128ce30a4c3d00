//! Streaming topology runtime for the oerflow pipeline.
//!
//! Provides the declarative [`TopologySpec`], the [`Bolt`]/[`Source`] stage
//! contracts, the at-least-once [`ack`] tree, heartbeat [`liveness`]
//! monitoring, and the [`router`] that runs it all on tokio tasks with
//! bounded channels between stages.

pub mod ack;
pub mod harness;
pub mod liveness;
pub mod router;
pub mod spec;
pub mod stage;

pub use ack::{AckHandle, AckOutcome, AckTracker, RootId};
pub use harness::{HarnessOutput, StageHarness};
pub use liveness::Liveness;
pub use router::{RuntimeOptions, ShutdownReport, StageReport, TopologyHandle, run};
pub use spec::{BoltSpec, InputBinding, SpoutSpec, TopologySpec, load_topology};
pub use stage::{Bolt, Delivery, Emitter, Source, SourceMessage, StageContext, Supervisor};
