//! Spout sources: where raw material descriptors come from.
//!
//! All sources share the same redelivery contract: a message is held as
//! pending from `next` until `ack` or `fail`; a failed message is requeued
//! up to a bounded number of redeliveries, then dropped with a warning.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use oerflow_shared::{PipelineError, RawDescriptor, Result};
use oerflow_topology::{Source, SourceMessage};

const DEFAULT_MAX_REDELIVERIES: u32 = 2;

/// How often a drained finite source re-checks for requeued messages while
/// deliveries are still pending in the DAG.
const PENDING_RECHECK: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Finite in-memory source, for embedding and tests.
pub struct MemorySource {
    queue: VecDeque<SourceMessage>,
    pending: HashMap<String, RawDescriptor>,
    attempts: HashMap<String, u32>,
    max_redeliveries: u32,
}

impl MemorySource {
    pub fn new(descriptors: Vec<RawDescriptor>) -> Self {
        let queue = descriptors
            .into_iter()
            .enumerate()
            .map(|(i, descriptor)| SourceMessage {
                id: format!("mem-{i}"),
                descriptor,
            })
            .collect();
        Self {
            queue,
            pending: HashMap::new(),
            attempts: HashMap::new(),
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
        }
    }

    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    fn requeue_or_drop(&mut self, msg_id: &str) {
        let Some(descriptor) = self.pending.remove(msg_id) else {
            debug!(msg_id, "fail for unknown message");
            return;
        };
        let attempts = self.attempts.entry(msg_id.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts > self.max_redeliveries {
            warn!(
                msg_id,
                attempts = *attempts,
                "dropping message after exhausted redeliveries"
            );
            self.attempts.remove(msg_id);
            return;
        }
        debug!(msg_id, attempt = *attempts, "requeueing failed message");
        self.queue.push_back(SourceMessage {
            id: msg_id.to_string(),
            descriptor,
        });
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn next(&mut self) -> Result<Option<SourceMessage>> {
        // Finite source: exhausted only once nothing is pending either, so
        // failed messages can still come back around. While deliveries are
        // outstanding an empty queue just means waiting for their outcomes.
        loop {
            if let Some(message) = self.queue.pop_front() {
                self.pending
                    .insert(message.id.clone(), message.descriptor.clone());
                return Ok(Some(message));
            }
            if self.pending.is_empty() {
                return Ok(None);
            }
            tokio::time::sleep(PENDING_RECHECK).await;
        }
    }

    async fn ack(&mut self, msg_id: &str) -> Result<()> {
        self.pending.remove(msg_id);
        self.attempts.remove(msg_id);
        Ok(())
    }

    async fn fail(&mut self, msg_id: &str) -> Result<()> {
        self.requeue_or_drop(msg_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonlSource
// ---------------------------------------------------------------------------

/// Reads raw descriptors from a JSONL file, one JSON object per line.
///
/// Unparseable lines are skipped with a warning; they never abort the run.
pub struct JsonlSource {
    path: PathBuf,
    inner: MemorySource,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: MemorySource::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Source for JsonlSource {
    async fn init(&mut self, name: &str) -> Result<()> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| PipelineError::io(&self.path, e))?;

        let mut descriptors = Vec::new();
        let mut skipped = 0usize;
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RawDescriptor>(line) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    warn!(
                        stage = name,
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "skipping unparseable descriptor line"
                    );
                    skipped += 1;
                }
            }
        }
        tracing::info!(
            stage = name,
            path = %self.path.display(),
            loaded = descriptors.len(),
            skipped,
            "loaded descriptor file"
        );
        self.inner = MemorySource::new(descriptors);
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<SourceMessage>> {
        self.inner.next().await
    }

    async fn ack(&mut self, msg_id: &str) -> Result<()> {
        self.inner.ack(msg_id).await
    }

    async fn fail(&mut self, msg_id: &str) -> Result<()> {
        self.inner.fail(msg_id).await
    }
}

// ---------------------------------------------------------------------------
// HttpPollSource
// ---------------------------------------------------------------------------

/// One message as delivered by the upstream queue's HTTP facade.
#[derive(Debug, Deserialize)]
struct PollMessage {
    id: String,
    descriptor: RawDescriptor,
}

#[derive(Debug, Serialize)]
struct Receipt<'a> {
    id: &'a str,
}

/// Polls an upstream queue over HTTP.
///
/// `GET {endpoint}/next` returns 200 with a message or 204 when the queue is
/// momentarily empty; acks and fails are posted back so the queue can settle
/// or redeliver. This source never exhausts on its own.
pub struct HttpPollSource {
    endpoint: String,
    poll_interval: Duration,
    timeout: Duration,
    client: Option<Client>,
}

impl HttpPollSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            poll_interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(10),
            client: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, action: &str) -> String {
        format!("{}/{action}", self.endpoint.trim_end_matches('/'))
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| PipelineError::Source("http source not initialized".into()))
    }

    async fn post_receipt(&self, action: &str, msg_id: &str) -> Result<()> {
        let response = self
            .client()?
            .post(self.url(action))
            .json(&Receipt { id: msg_id })
            .send()
            .await
            .map_err(|e| PipelineError::Source(format!("{action} {msg_id}: {e}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::Source(format!(
                "{action} {msg_id}: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Source for HttpPollSource {
    async fn init(&mut self, _name: &str) -> Result<()> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| PipelineError::Source(format!("failed to build HTTP client: {e}")))?;
        self.client = Some(client);
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<SourceMessage>> {
        loop {
            let response = self
                .client()?
                .get(self.url("next"))
                .send()
                .await
                .map_err(|e| PipelineError::Source(format!("poll: {e}")))?;

            match response.status() {
                status if status == reqwest::StatusCode::NO_CONTENT => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                status if status.is_success() => {
                    let message: PollMessage = response
                        .json()
                        .await
                        .map_err(|e| PipelineError::Source(format!("poll body: {e}")))?;
                    return Ok(Some(SourceMessage {
                        id: message.id,
                        descriptor: message.descriptor,
                    }));
                }
                status => {
                    return Err(PipelineError::Source(format!("poll: HTTP {status}")));
                }
            }
        }
    }

    async fn ack(&mut self, msg_id: &str) -> Result<()> {
        self.post_receipt("ack", msg_id).await
    }

    async fn fail(&mut self, msg_id: &str) -> Result<()> {
        self.post_receipt("fail", msg_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(url: &str) -> RawDescriptor {
        RawDescriptor {
            material_url: url.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn memory_source_redelivers_failed_messages() {
        let mut source = MemorySource::new(vec![descriptor("http://x.edu/v1")]);

        let first = source.next().await.expect("next").expect("message");
        assert_eq!(first.id, "mem-0");

        source.fail("mem-0").await.expect("fail");
        let redelivered = source.next().await.expect("next").expect("redelivery");
        assert_eq!(redelivered.id, "mem-0");

        source.ack("mem-0").await.expect("ack");
        assert!(source.next().await.expect("next").is_none());
    }

    #[tokio::test]
    async fn memory_source_waits_for_pending_before_exhausting() {
        let mut source = MemorySource::new(vec![descriptor("http://x.edu/v1")]);
        let msg = source.next().await.expect("next").expect("message");

        // The queue is empty but the message is still unresolved: the source
        // must not report exhaustion, or a later fail() would requeue into a
        // queue nobody polls.
        let waited = tokio::time::timeout(Duration::from_millis(50), source.next()).await;
        assert!(waited.is_err(), "source exhausted with a pending message");

        source.fail(&msg.id).await.expect("fail");
        let redelivered = source.next().await.expect("next").expect("redelivery");
        assert_eq!(redelivered.id, "mem-0");
        source.ack(&msg.id).await.expect("ack");
        assert!(source.next().await.expect("next").is_none());
    }

    #[tokio::test]
    async fn memory_source_drops_after_exhausted_redeliveries() {
        let mut source =
            MemorySource::new(vec![descriptor("http://x.edu/v1")]).with_max_redeliveries(1);

        let msg = source.next().await.expect("next").expect("message");
        source.fail(&msg.id).await.expect("fail");
        let msg = source.next().await.expect("next").expect("redelivery");
        source.fail(&msg.id).await.expect("fail again");

        assert!(source.next().await.expect("next").is_none());
    }

    #[tokio::test]
    async fn jsonl_source_skips_bad_lines() {
        let tmp = std::env::temp_dir().join(format!("oerflow_src_{}.jsonl", uuid::Uuid::now_v7()));
        std::fs::write(
            &tmp,
            concat!(
                r#"{"material_url": "http://x.edu/v1", "title": "Lecture 1"}"#,
                "\n",
                "this is not json\n",
                "\n",
                r#"{"material_url": "http://x.edu/v2"}"#,
                "\n",
            ),
        )
        .expect("write fixture");

        let mut source = JsonlSource::new(&tmp);
        source.init("material-input").await.expect("init");

        let first = source.next().await.expect("next").expect("first");
        assert_eq!(first.descriptor.material_url, "http://x.edu/v1");
        assert_eq!(first.descriptor.title.as_deref(), Some("Lecture 1"));
        let second = source.next().await.expect("next").expect("second");
        assert_eq!(second.descriptor.material_url, "http://x.edu/v2");

        source.ack(&first.id).await.expect("ack first");
        source.ack(&second.id).await.expect("ack second");
        assert!(source.next().await.expect("next").is_none());
    }

    #[tokio::test]
    async fn http_source_polls_and_settles() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/queue/next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "q-1",
                "descriptor": { "material_url": "http://x.edu/v1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queue/ack"))
            .and(body_json(serde_json::json!({ "id": "q-1" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut source = HttpPollSource::new(format!("{}/queue", server.uri()));
        source.init("material-input").await.expect("init");

        let msg = source.next().await.expect("next").expect("message");
        assert_eq!(msg.id, "q-1");
        assert_eq!(msg.descriptor.material_url, "http://x.edu/v1");
        source.ack("q-1").await.expect("ack");
    }

    #[tokio::test]
    async fn failed_delivery_is_redelivered_in_a_running_topology() {
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{Arc, Mutex};

        use async_trait::async_trait;
        use oerflow_shared::{Material, StreamTag};
        use oerflow_topology::{
            AckHandle, Bolt, BoltSpec, InputBinding, RuntimeOptions, SpoutSpec, StageContext,
            TopologySpec, run,
        };

        /// Fails the first delivery it sees, acks everything after.
        struct FlakyBolt {
            deliveries: Arc<Mutex<Vec<String>>>,
            failed_once: AtomicBool,
        }

        #[async_trait]
        impl Bolt for FlakyBolt {
            async fn init(&mut self, _ctx: StageContext) -> Result<()> {
                Ok(())
            }

            async fn process(&self, material: Material, _stream: StreamTag, ack: AckHandle) {
                self.deliveries
                    .lock()
                    .expect("lock")
                    .push(material.material_url().to_string());
                if self.failed_once.swap(true, Ordering::Relaxed) {
                    ack.done();
                } else {
                    ack.fail("transient sink error");
                }
            }
        }

        let spec = TopologySpec {
            name: "redelivery".into(),
            spouts: vec![SpoutSpec {
                name: "input".into(),
                source: "memory".into(),
                params: serde_json::Value::Null,
            }],
            bolts: vec![BoltSpec {
                name: "sink".into(),
                kind: "flaky".into(),
                inputs: vec![InputBinding::main("input")],
                params: serde_json::Value::Null,
            }],
        };

        let deliveries = Arc::new(Mutex::new(Vec::new()));
        let mut bolts: HashMap<String, Box<dyn Bolt>> = HashMap::new();
        bolts.insert(
            "sink".into(),
            Box::new(FlakyBolt {
                deliveries: Arc::clone(&deliveries),
                failed_once: AtomicBool::new(false),
            }),
        );
        let mut sources: HashMap<String, Box<dyn Source>> = HashMap::new();
        sources.insert(
            "input".into(),
            Box::new(MemorySource::new(vec![descriptor("http://x.edu/v1")])),
        );

        let opts = RuntimeOptions {
            heartbeat: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(2),
            ..RuntimeOptions::default()
        };
        let handle = run(spec, bolts, sources, opts).await.expect("starts");
        let report = handle.join().await;

        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
        assert_eq!(
            deliveries.lock().expect("lock").as_slice(),
            ["http://x.edu/v1", "http://x.edu/v1"],
            "failed message must come back around"
        );
    }

    #[tokio::test]
    async fn http_source_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queue/next"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut source = HttpPollSource::new(format!("{}/queue", server.uri()));
        source.init("material-input").await.expect("init");

        let err = source.next().await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
