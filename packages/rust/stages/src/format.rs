//! material-format bolt: descriptor normalization.

use async_trait::async_trait;

use oerflow_shared::{Material, Result, StreamTag};
use oerflow_topology::{AckHandle, Bolt, Emitter, StageContext};

/// Normalizes the envelope built at admission: trims text fields, lowercases
/// the language code, derives the provider reference and short material type.
#[derive(Default)]
pub struct FormatBolt {
    name: String,
    emitter: Option<Emitter>,
}

impl FormatBolt {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bolt for FormatBolt {
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
        normalize(&mut material);

        emitter
            .emit(StreamTag::Partial, material.clone(), &ack)
            .await;
        emitter.emit(StreamTag::Main, material, &ack).await;
        ack.done();
    }
}

fn normalize(material: &mut Material) {
    material.title = clean(material.title.take());
    material.description = clean(material.description.take());
    material.license = clean(material.license.take());
    material.mimetype = clean(material.mimetype.take()).map(|m| m.to_ascii_lowercase());

    material.language = clean(material.language.take()).map(|l| l.to_ascii_lowercase());

    material.authors = material
        .authors
        .drain(..)
        .filter_map(|a| clean(Some(a)))
        .collect();

    // provider falls back to the material's own host
    if material.provider_uri.is_none() {
        material.provider_uri = material
            .material_url()
            .host_str()
            .map(|host| format!("{}://{host}", material.material_url().scheme()));
    }

    material.material_type = material.mimetype.as_deref().map(derive_material_type);
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Short type used by the catalog: "video", "audio", or "text".
fn derive_material_type(mimetype: &str) -> String {
    if mimetype.starts_with("video/") {
        "video".into()
    } else if mimetype.starts_with("audio/") {
        "audio".into()
    } else {
        "text".into()
    }
}
