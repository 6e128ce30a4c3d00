//! Terminal stages: catalog sinks and the partial-capture sink.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use oerflow_shared::config::{PartialFailurePolicy, StorageConfig};
use oerflow_shared::{Material, PartialSnapshot, PipelineError, Result, StreamTag};
use oerflow_storage::Storage;
use oerflow_topology::{AckHandle, Bolt, StageContext, Supervisor};

// ---------------------------------------------------------------------------
// CatalogSink
// ---------------------------------------------------------------------------

/// Persists validated envelopes into one catalog table.
///
/// Writes are idempotent upserts keyed by material URL. Failed writes retry
/// with bounded exponential backoff; an exhausted write failure-acks the
/// record, and a run of consecutive exhausted writes reports the sink
/// unavailable to the supervisor, halting spout intake until the next
/// successful write.
pub struct CatalogSink {
    config: StorageConfig,
    table: String,
    name: String,
    storage: Option<Storage>,
    supervisor: Option<Supervisor>,
    consecutive_failures: AtomicU32,
    halted: AtomicBool,
}

impl CatalogSink {
    /// Sink writing to an explicit catalog table.
    pub fn new(config: StorageConfig, table: impl Into<String>) -> Self {
        Self {
            config,
            table: table.into(),
            name: String::new(),
            storage: None,
            supervisor: None,
            consecutive_failures: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Sink writing to the configured production table.
    pub fn production(config: StorageConfig) -> Self {
        let table = config.production_table.clone();
        Self::new(config, table)
    }

    /// Sink writing to the configured staging table.
    pub fn staging(config: StorageConfig) -> Self {
        let table = config.staging_table.clone();
        Self::new(config, table)
    }

    async fn write_with_retry(&self, storage: &Storage, material: &Material) -> Result<()> {
        let attempts = self.config.write_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.write_backoff_ms);

        for attempt in 1..=attempts {
            match storage.upsert_material(&self.table, material).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        stage = %self.name,
                        url = %material.material_url(),
                        attempt,
                        error = %e,
                        "catalog write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.halted.swap(false, Ordering::Relaxed) {
            if let Some(supervisor) = &self.supervisor {
                supervisor.resume_intake(&self.name);
            }
        }
    }

    fn record_exhausted_failure(&self) {
        let run = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if run >= self.config.unavailable_threshold && !self.halted.swap(true, Ordering::Relaxed) {
            if let Some(supervisor) = &self.supervisor {
                supervisor.halt_intake(&self.name, "catalog storage unavailable");
            }
        }
    }
}

#[async_trait]
impl Bolt for CatalogSink {
    async fn init(&mut self, ctx: StageContext) -> Result<()> {
        self.name = ctx.name().to_string();
        self.supervisor = Some(ctx.supervisor());
        let storage = Storage::open(Path::new(&self.config.db_path), &self.config).await?;
        info!(stage = %self.name, table = %self.table, db = %self.config.db_path, "catalog sink ready");
        self.storage = Some(storage);
        Ok(())
    }

    async fn process(&self, material: Material, _stream: StreamTag, ack: AckHandle) {
        let Some(storage) = &self.storage else {
            ack.fail("sink not initialized");
            return;
        };

        match self.write_with_retry(storage, &material).await {
            Ok(()) => {
                self.record_success();
                ack.done();
            }
            Err(e) => {
                warn!(
                    stage = %self.name,
                    url = %material.material_url(),
                    error = %e,
                    "catalog write exhausted retries"
                );
                self.record_exhausted_failure();
                ack.fail(format!("catalog write failed: {e}"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PartialSink
// ---------------------------------------------------------------------------

/// Persists labeled snapshots from the partial stream.
///
/// The partial store is diagnostic: a write failure is surfaced per the
/// configured policy but never retried and never propagated. The record's
/// ack succeeds regardless, so a broken diagnostic store cannot stall the
/// main path.
pub struct PartialSink {
    config: StorageConfig,
    name: String,
    storage: Option<Storage>,
    policy: PartialFailurePolicy,
}

impl PartialSink {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            name: String::new(),
            storage: None,
            // placeholder until init resolves the required config value
            policy: PartialFailurePolicy::Log,
        }
    }
}

#[async_trait]
impl Bolt for PartialSink {
    async fn init(&mut self, ctx: StageContext) -> Result<()> {
        self.name = ctx.name().to_string();
        // required, no default: refuse to start until operators choose
        self.policy = self.config.partial_failure_policy()?;
        let storage = Storage::open(Path::new(&self.config.db_path), &self.config).await?;
        info!(
            stage = %self.name,
            table = %self.config.partial_table,
            policy = ?self.policy,
            "partial sink ready"
        );
        self.storage = Some(storage);
        Ok(())
    }

    async fn process(&self, material: Material, _stream: StreamTag, ack: AckHandle) {
        let Some(storage) = &self.storage else {
            ack.fail("sink not initialized");
            return;
        };

        let snapshot = PartialSnapshot::capture(&material);
        if let Err(e) = storage
            .upsert_partial(&self.config.partial_table, &snapshot)
            .await
        {
            match self.policy {
                PartialFailurePolicy::Log => {
                    warn!(
                        stage = %self.name,
                        url = %material.material_url(),
                        source_stage = %snapshot.stage,
                        error = %e,
                        "partial snapshot write failed"
                    );
                }
                PartialFailurePolicy::Alert => {
                    error!(
                        stage = %self.name,
                        url = %material.material_url(),
                        source_stage = %snapshot.stage,
                        error = %e,
                        "partial snapshot write failed"
                    );
                }
            }
        }
        ack.done();
    }
}
