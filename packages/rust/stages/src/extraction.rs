//! content-extraction bolt: text retrieval via the extraction collaborator.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use oerflow_shared::config::ExtractionConfig;
use oerflow_shared::{Material, PipelineError, Result, StreamTag};
use oerflow_topology::{AckHandle, Bolt, Emitter, StageContext};

/// Metadata key the extracted text is stored under.
pub const RAW_TEXT_KEY: &str = "raw_text";

#[derive(Serialize)]
struct ExtractionRequest<'a> {
    material_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mimetype: Option<&'a str>,
}

#[derive(Deserialize)]
struct ExtractionResponse {
    text: String,
}

/// Calls the external content-extraction service and stores the returned
/// text on the envelope.
///
/// Extraction failure is recoverable: the envelope is forwarded with a
/// diagnostic message instead of text, and the validator decides its fate.
pub struct ExtractionBolt {
    config: ExtractionConfig,
    name: String,
    emitter: Option<Emitter>,
    client: Option<Client>,
}

impl ExtractionBolt {
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config,
            name: String::new(),
            emitter: None,
            client: None,
        }
    }

    async fn extract(&self, material: &Material) -> Result<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PipelineError::Extraction("stage not initialized".into()))?;

        let request = ExtractionRequest {
            material_url: material.material_url().as_str(),
            mimetype: material.mimetype.as_deref(),
        };

        let response = client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Extraction(format!("{}: {e}", material.material_url()))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Extraction(format!(
                "{}: HTTP {status}",
                material.material_url()
            )));
        }

        let body: ExtractionResponse = response.json().await.map_err(|e| {
            PipelineError::Extraction(format!("{}: invalid response: {e}", material.material_url()))
        })?;
        Ok(body.text)
    }
}

#[async_trait]
impl Bolt for ExtractionBolt {
    async fn init(&mut self, ctx: StageContext) -> Result<()> {
        self.name = ctx.name().to_string();
        self.emitter = Some(ctx.emitter());
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(self.config.timeout_ms))
            .build()
            .map_err(|e| PipelineError::Extraction(format!("failed to build HTTP client: {e}")))?;
        self.client = Some(client);
        Ok(())
    }

    async fn process(&self, mut material: Material, _stream: StreamTag, ack: AckHandle) {
        let Some(emitter) = &self.emitter else {
            ack.fail("stage not initialized");
            return;
        };

        material.record_stage(&self.name);

        match self.extract(&material).await {
            Ok(text) if !text.trim().is_empty() => {
                material
                    .material_metadata
                    .insert(RAW_TEXT_KEY.into(), Value::String(text));
            }
            Ok(_) => {
                material.note("content extraction returned no text");
            }
            Err(e) => {
                warn!(stage = %self.name, url = %material.material_url(), error = %e, "extraction failed");
                material.note(format!("content extraction failed: {e}"));
            }
        }

        emitter
            .emit(StreamTag::Partial, material.clone(), &ack)
            .await;
        emitter.emit(StreamTag::Main, material, &ack).await;
        ack.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oerflow_shared::RawDescriptor;
    use oerflow_topology::StageHarness;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn material(url: &str) -> Material {
        let parsed = Url::parse(url).expect("url");
        Material::new(
            parsed,
            RawDescriptor {
                material_url: url.into(),
                mimetype: Some("video/mp4".into()),
                ..Default::default()
            },
        )
    }

    fn config(server: &MockServer) -> ExtractionConfig {
        ExtractionConfig {
            endpoint: format!("{}/extract", server.uri()),
            timeout_ms: 2000,
        }
    }

    #[tokio::test]
    async fn stores_extracted_text_in_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/extract"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "eigenvalues and eigenvectors"
            })))
            .mount(&server)
            .await;

        let mut harness = StageHarness::init(
            "content-extraction",
            Box::new(ExtractionBolt::new(config(&server))),
        )
        .await
        .expect("init");

        let output = harness
            .process(material("http://x.edu/v1"), StreamTag::Main)
            .await;
        assert!(output.acked());
        let forwarded = output.sole_main().expect("one main emission");
        assert_eq!(
            forwarded.material_metadata.get(RAW_TEXT_KEY),
            Some(&Value::String("eigenvalues and eigenvectors".into()))
        );
        assert_eq!(forwarded.message, None);
    }

    #[tokio::test]
    async fn collaborator_error_forwards_with_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/extract"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut harness = StageHarness::init(
            "content-extraction",
            Box::new(ExtractionBolt::new(config(&server))),
        )
        .await
        .expect("init");

        let output = harness
            .process(material("http://x.edu/v2"), StreamTag::Main)
            .await;

        // recoverable: still acked and still forwarded, just without text
        assert!(output.acked());
        let forwarded = output.sole_main().expect("one main emission");
        assert!(!forwarded.material_metadata.contains_key(RAW_TEXT_KEY));
        assert!(
            forwarded
                .message
                .as_deref()
                .expect("diagnostic message")
                .contains("content extraction failed")
        );
        // the partial snapshot carries the same diagnostic
        assert_eq!(output.partial.len(), 1);
        assert_eq!(output.partial[0].message, forwarded.message);
    }

    #[tokio::test]
    async fn empty_text_is_noted_not_stored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/extract"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "text": "   " })),
            )
            .mount(&server)
            .await;

        let mut harness = StageHarness::init(
            "content-extraction",
            Box::new(ExtractionBolt::new(config(&server))),
        )
        .await
        .expect("init");

        let output = harness
            .process(material("http://x.edu/v3"), StreamTag::Main)
            .await;
        let forwarded = output.sole_main().expect("one main emission");
        assert!(!forwarded.material_metadata.contains_key(RAW_TEXT_KEY));
        assert_eq!(
            forwarded.message.as_deref(),
            Some("content extraction returned no text")
        );
    }
}
