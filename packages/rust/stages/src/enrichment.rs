//! concept-enrichment bolt: Wikipedia concept annotation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use oerflow_shared::config::EnrichmentConfig;
use oerflow_shared::{Material, PipelineError, Result, StreamTag};
use oerflow_topology::{AckHandle, Bolt, Emitter, StageContext};

use crate::extraction::RAW_TEXT_KEY;

/// Metadata key the concept list is stored under.
pub const CONCEPTS_KEY: &str = "wikipedia_concepts";

#[derive(Serialize)]
struct AnnotationRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    user_key: &'a str,
}

/// One annotated concept, as stored in the metadata map.
#[derive(Debug, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub cosine: f64,
    #[serde(default)]
    pub page_rank: f64,
}

#[derive(Deserialize)]
struct AnnotationResponse {
    #[serde(default)]
    concepts: Vec<Concept>,
}

/// Sends extracted text to the concept-annotation collaborator and stores
/// the returned concepts on the envelope.
///
/// Skipped with a diagnostic when no text is present; collaborator failure
/// is recoverable and forwards the envelope unenriched.
pub struct EnrichmentBolt {
    config: EnrichmentConfig,
    name: String,
    emitter: Option<Emitter>,
    client: Option<Client>,
    user_key: String,
}

impl EnrichmentBolt {
    pub fn new(config: EnrichmentConfig) -> Self {
        Self {
            config,
            name: String::new(),
            emitter: None,
            client: None,
            user_key: String::new(),
        }
    }

    async fn annotate(&self, text: &str, language: Option<&str>) -> Result<Vec<Concept>> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PipelineError::Enrichment("stage not initialized".into()))?;

        let request = AnnotationRequest {
            text,
            language,
            user_key: &self.user_key,
        };

        let response = client
            .post(&self.config.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Enrichment(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Enrichment(format!("HTTP {status}")));
        }

        let body: AnnotationResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Enrichment(format!("invalid response: {e}")))?;
        Ok(body.concepts)
    }
}

#[async_trait]
impl Bolt for EnrichmentBolt {
    async fn init(&mut self, ctx: StageContext) -> Result<()> {
        self.name = ctx.name().to_string();
        self.emitter = Some(ctx.emitter());

        // the user key never lives in config, only in the environment
        self.user_key = std::env::var(&self.config.user_key_env).map_err(|_| {
            PipelineError::config(format!(
                "enrichment user key not found. Set the {} environment variable.",
                self.config.user_key_env
            ))
        })?;

        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(self.config.timeout_ms))
            .build()
            .map_err(|e| PipelineError::Enrichment(format!("failed to build HTTP client: {e}")))?;
        self.client = Some(client);
        Ok(())
    }

    async fn process(&self, mut material: Material, _stream: StreamTag, ack: AckHandle) {
        let Some(emitter) = &self.emitter else {
            ack.fail("stage not initialized");
            return;
        };

        material.record_stage(&self.name);

        let text = material
            .material_metadata
            .get(RAW_TEXT_KEY)
            .and_then(Value::as_str)
            .map(str::to_owned);

        match text {
            Some(text) if !text.trim().is_empty() => {
                match self.annotate(&text, material.language.as_deref()).await {
                    Ok(concepts) => match serde_json::to_value(&concepts) {
                        Ok(value) => {
                            material.material_metadata.insert(CONCEPTS_KEY.into(), value);
                        }
                        Err(e) => {
                            material.note(format!("concept enrichment failed: {e}"));
                        }
                    },
                    Err(e) => {
                        warn!(stage = %self.name, url = %material.material_url(), error = %e, "enrichment failed");
                        material.note(format!("concept enrichment failed: {e}"));
                    }
                }
            }
            _ => {
                material.note("no extracted text, skipping concept enrichment");
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
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY_ENV: &str = "OERFLOW_TEST_WIKIFIER_KEY";

    fn material(url: &str, raw_text: Option<&str>) -> Material {
        let parsed = Url::parse(url).expect("url");
        let mut material = Material::new(
            parsed,
            RawDescriptor {
                material_url: url.into(),
                language: Some("en".into()),
                ..Default::default()
            },
        );
        if let Some(text) = raw_text {
            material
                .material_metadata
                .insert(RAW_TEXT_KEY.into(), Value::String(text.into()));
        }
        material
    }

    fn config(server: &MockServer) -> EnrichmentConfig {
        EnrichmentConfig {
            endpoint: format!("{}/annotate", server.uri()),
            user_key_env: TEST_KEY_ENV.into(),
            timeout_ms: 2000,
        }
    }

    async fn harness(server: &MockServer) -> StageHarness {
        // SAFETY: test-only env mutation, key name is test-local
        unsafe { std::env::set_var(TEST_KEY_ENV, "test-key") };
        StageHarness::init(
            "concept-enrichment",
            Box::new(EnrichmentBolt::new(config(server))),
        )
        .await
        .expect("init")
    }

    #[tokio::test]
    async fn stores_concepts_in_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/annotate"))
            .and(body_partial_json(serde_json::json!({
                "language": "en",
                "user_key": "test-key"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "concepts": [
                    { "name": "Eigenvalue", "uri": "http://en.wikipedia.org/wiki/Eigenvalue",
                      "cosine": 0.82, "page_rank": 0.4 }
                ]
            })))
            .mount(&server)
            .await;

        let mut harness = harness(&server).await;
        let output = harness
            .process(material("http://x.edu/v1", Some("eigenvalues")), StreamTag::Main)
            .await;

        assert!(output.acked());
        let forwarded = output.sole_main().expect("one main emission");
        let concepts = forwarded
            .material_metadata
            .get(CONCEPTS_KEY)
            .expect("concepts stored");
        assert_eq!(concepts[0]["name"], "Eigenvalue");
    }

    #[tokio::test]
    async fn skips_without_text() {
        let server = MockServer::start().await;
        // no mock mounted: any request would 404 and fail the assertions below

        let mut harness = harness(&server).await;
        let output = harness
            .process(material("http://x.edu/v2", None), StreamTag::Main)
            .await;

        assert!(output.acked());
        let forwarded = output.sole_main().expect("one main emission");
        assert!(!forwarded.material_metadata.contains_key(CONCEPTS_KEY));
        assert_eq!(
            forwarded.message.as_deref(),
            Some("no extracted text, skipping concept enrichment")
        );
    }

    #[tokio::test]
    async fn collaborator_error_forwards_unenriched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/annotate"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let mut harness = harness(&server).await;
        let output = harness
            .process(
                material("http://x.edu/v3", Some("matrices")),
                StreamTag::Main,
            )
            .await;

        assert!(output.acked());
        let forwarded = output.sole_main().expect("one main emission");
        assert!(!forwarded.material_metadata.contains_key(CONCEPTS_KEY));
        assert!(
            forwarded
                .message
                .as_deref()
                .expect("diagnostic message")
                .contains("concept enrichment failed")
        );
    }

    #[tokio::test]
    async fn missing_user_key_aborts_init() {
        let server = MockServer::start().await;
        let mut config = config(&server);
        config.user_key_env = "OERFLOW_TEST_KEY_DEFINITELY_UNSET".into();

        let err = StageHarness::init("concept-enrichment", Box::new(EnrichmentBolt::new(config)))
            .await
            .err()
            .expect("init must fail");
        assert!(err.to_string().contains("user key"));
    }
}
