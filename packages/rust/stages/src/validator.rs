//! material-validator bolt: catalog admission policy.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use oerflow_shared::config::ValidationConfig;
use oerflow_shared::{Material, Result, StreamTag, ValidationStatus};
use oerflow_topology::{AckHandle, Bolt, Emitter, StageContext};

use crate::extraction::RAW_TEXT_KEY;

/// Applies the validation policy and routes the envelope.
///
/// Passing records continue on the main stream toward the catalog sinks.
/// Failing records get status `Failed` and only the partial snapshot; their
/// fate is decided, so the ack still succeeds (a failure-ack would trigger a
/// pointless redelivery of a record that will fail again).
pub struct ValidatorBolt {
    policy: ValidationConfig,
    name: String,
    emitter: Option<Emitter>,
}

impl ValidatorBolt {
    pub fn new(policy: ValidationConfig) -> Self {
        Self {
            policy,
            name: String::new(),
            emitter: None,
        }
    }
}

#[async_trait]
impl Bolt for ValidatorBolt {
    async fn init(&mut self, ctx: StageContext) -> Result<()> {
        self.name = ctx.name().to_string();
        self.emitter = Some(ctx.emitter());
        Ok(())
    }

    async fn process(&self, mut material: Material, _stream: StreamTag, ack: AckHandle) {
        let Some(emitter) = &self.emitter else {
            ack.fail("stage not initialized");
            return;
        };

        material.record_stage(&self.name);

        match validate(&material, &self.policy) {
            Ok(()) => {
                material.validation = ValidationStatus::Passed;
                emitter
                    .emit(StreamTag::Partial, material.clone(), &ack)
                    .await;
                emitter.emit(StreamTag::Main, material, &ack).await;
            }
            Err(reason) => {
                debug!(stage = %self.name, url = %material.material_url(), %reason, "validation failed");
                material.note(format!("validation failed: {reason}"));
                material.validation = ValidationStatus::Failed { reason };
                emitter.emit(StreamTag::Partial, material, &ack).await;
            }
        }
        ack.done();
    }
}

fn validate(material: &Material, policy: &ValidationConfig) -> std::result::Result<(), String> {
    if material.title.as_deref().is_none_or(str::is_empty) {
        return Err("missing title".into());
    }

    match material.language.as_deref() {
        Some(lang) if lang.len() == 2 && lang.chars().all(|c| c.is_ascii_lowercase()) => {}
        Some(lang) => return Err(format!("invalid language code '{lang}'")),
        None => return Err("missing language".into()),
    }

    if material.mimetype.as_deref().is_none_or(str::is_empty) {
        return Err("missing mimetype".into());
    }

    if policy.require_extracted_content {
        let has_text = material
            .material_metadata
            .get(RAW_TEXT_KEY)
            .and_then(Value::as_str)
            .is_some_and(|t| !t.trim().is_empty());
        if !has_text {
            return Err("no extracted content".into());
        }
    }

    if policy.require_license && material.license.as_deref().is_none_or(str::is_empty) {
        return Err("missing license".into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use oerflow_shared::RawDescriptor;
    use oerflow_topology::StageHarness;
    use url::Url;

    fn valid_material(url: &str) -> Material {
        let parsed = Url::parse(url).expect("url");
        let mut material = Material::new(
            parsed,
            RawDescriptor {
                material_url: url.into(),
                title: Some("Linear Algebra".into()),
                language: Some("en".into()),
                mimetype: Some("video/mp4".into()),
                ..Default::default()
            },
        );
        material
            .material_metadata
            .insert(RAW_TEXT_KEY.into(), Value::String("matrices".into()));
        material
    }

    async fn harness(policy: ValidationConfig) -> StageHarness {
        StageHarness::init("material-validator", Box::new(ValidatorBolt::new(policy)))
            .await
            .expect("init")
    }

    #[tokio::test]
    async fn passing_record_continues_on_main() {
        let mut harness = harness(ValidationConfig::default()).await;
        let output = harness
            .process(valid_material("http://x.edu/v1"), StreamTag::Main)
            .await;

        assert!(output.acked());
        let forwarded = output.sole_main().expect("one main emission");
        assert_eq!(forwarded.validation, ValidationStatus::Passed);
        assert_eq!(output.partial.len(), 1);
    }

    #[tokio::test]
    async fn failing_record_is_acked_but_not_forwarded() {
        let mut harness = harness(ValidationConfig::default()).await;
        let mut material = valid_material("http://x.edu/v2");
        material.title = None;

        let output = harness.process(material, StreamTag::Main).await;

        // fate decided: ack succeeds, no redelivery
        assert!(output.acked());
        assert!(output.main.is_empty());
        assert_eq!(output.partial.len(), 1);
        let snapshot = &output.partial[0];
        assert!(matches!(
            &snapshot.validation,
            ValidationStatus::Failed { reason } if reason == "missing title"
        ));
        assert!(
            snapshot
                .message
                .as_deref()
                .expect("diagnostic")
                .contains("validation failed")
        );
    }

    #[tokio::test]
    async fn language_code_must_be_two_lowercase_letters() {
        let mut harness = harness(ValidationConfig::default()).await;
        let mut material = valid_material("http://x.edu/v3");
        material.language = Some("eng".into());

        let output = harness.process(material, StreamTag::Main).await;
        assert!(output.main.is_empty());
        assert!(matches!(
            &output.partial[0].validation,
            ValidationStatus::Failed { reason } if reason.contains("invalid language")
        ));
    }

    #[tokio::test]
    async fn extracted_content_requirement_is_configurable() {
        let mut material = valid_material("http://x.edu/v4");
        material.material_metadata.remove(RAW_TEXT_KEY);

        let mut strict = harness(ValidationConfig::default()).await;
        let output = strict.process(material.clone(), StreamTag::Main).await;
        assert!(output.main.is_empty());

        let mut lax = harness(ValidationConfig {
            require_extracted_content: false,
            require_license: false,
        })
        .await;
        let output = lax.process(material, StreamTag::Main).await;
        assert_eq!(output.main.len(), 1);
    }

    #[tokio::test]
    async fn license_requirement_is_configurable() {
        let mut harness = harness(ValidationConfig {
            require_extracted_content: true,
            require_license: true,
        })
        .await;

        let output = harness
            .process(valid_material("http://x.edu/v5"), StreamTag::Main)
            .await;
        assert!(output.main.is_empty());
        assert!(matches!(
            &output.partial[0].validation,
            ValidationStatus::Failed { reason } if reason == "missing license"
        ));
    }
}
